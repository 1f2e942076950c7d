//! Argument matching for calls whose callee became known after the front
//! end: named calls against a statically visible closure are reordered into
//! positional form, which unblocks the inliner and context refinement.

use tarn_bytecode::context::{ArgAssumptions, Assumptions, Context};
use tarn_bytecode::module::FunId;

use super::{Pass, PassCtx};
use crate::frontend::args::{match_call_args, MatchedArg};
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;

/// The sharpest context the given argument values support.
pub fn static_call_ctx(code: &Code, args: &[Value]) -> Context {
    let mut ctx = Context::minimal();
    ctx.flags |= Assumptions::STATICALLY_ARG_MATCHED
        | Assumptions::NOT_TOO_FEW_ARGUMENTS
        | Assumptions::NO_EXPLICITLY_MISSING_ARGS;
    let mut missing = 0u8;
    for (i, arg) in args.iter().enumerate() {
        if *arg == Value::Missing {
            missing = missing.saturating_add(1);
            continue;
        }
        let ty = arg.ty(code);
        let mut a = ArgAssumptions::empty();
        if !ty.maybe_lazy() {
            a |= ArgAssumptions::EAGER;
        }
        if !ty.maybe_obj() {
            a |= ArgAssumptions::NOT_OBJ;
        }
        if ty.is_a(&crate::ir::ty::PirType::int().scalar().not_object().no_attribs()) {
            a |= ArgAssumptions::SIMPLE_INT;
        }
        if ty.is_a(&crate::ir::ty::PirType::real().scalar().not_object().no_attribs()) {
            a |= ArgAssumptions::SIMPLE_REAL;
        }
        ctx.set_arg(i, a);
    }
    ctx.missing = missing;
    if missing > 0 {
        ctx.flags -= Assumptions::NO_EXPLICITLY_MISSING_ARGS;
    }
    ctx
}

/// The statically known callee of a call, if any.
pub fn known_callee(code: &Code, callee: &Value) -> Option<FunId> {
    match callee.followed(code) {
        Value::Instr(id) => match code.instr(id).tag {
            Tag::MkFunCls { fun } => Some(fun),
            _ => None,
        },
        _ => None,
    }
}

pub struct MatchCallArgs;

impl Pass for MatchCallArgs {
    fn name(&self) -> &'static str {
        "match-call-args"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;

        let mut worklist: Vec<InstrId> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if matches!(code.instr(*id).tag, Tag::NamedCall { .. } | Tag::Call { .. }) {
                    worklist.push(*id);
                }
            }
        });

        for id in worklist {
            let instr = code.instr(id);
            let Some(callee) = instr.callee() else { continue };
            let Some(fun) = known_callee(code, &callee) else { continue };
            let formals = &ctx.functions[fun.0 as usize].formals;
            if formals.has_dots() {
                continue;
            }

            let (names, args): (Vec<Option<tarn_bytecode::Symbol>>, Vec<Value>) =
                match &code.instr(id).tag {
                    Tag::NamedCall { names, .. } => {
                        (names.clone(), code.instr(id).call_args().to_vec())
                    }
                    Tag::Call { nargs, .. } => {
                        // Positional call that under- or over-applies still
                        // benefits from a match (fills missing slots)
                        if *nargs == formals.num_args() {
                            continue;
                        }
                        (vec![None; *nargs], code.instr(id).call_args().to_vec())
                    }
                    _ => continue,
                };

            let Some(matched) = match_call_args(formals, &args, &names) else { continue };
            let mut new_args = Vec::with_capacity(matched.len());
            let mut ok = true;
            for m in &matched {
                match m {
                    MatchedArg::Val(v) => new_args.push(*v),
                    MatchedArg::Missing => new_args.push(Value::Missing),
                    MatchedArg::Dots(_) => {
                        ok = false;
                        break;
                    }
                }
            }
            if !ok {
                continue;
            }

            let env = code.instr(id).env().unwrap();
            let fs = code.instr(id).frame_state();
            let n = new_args.len();
            let mut full = vec![callee];
            full.extend(new_args);
            full.push(env);
            let has_fs = fs.is_some();
            if let Some(fs) = fs {
                full.push(fs);
            }
            let bb = code.instr(id).bb;
            let pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();
            let new = code.replace_at(bb, pos, Tag::Call { nargs: n, has_fs }, full);
            code.replace_uses_with(id, Value::Instr(new));
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{BcFunction, Formals};
    use tarn_bytecode::Symbol;

    #[test]
    fn test_named_call_reordered() {
        let functions = vec![BcFunction {
            name: "g".into(),
            formals: Formals::new(vec![Symbol(10), Symbol(11)]),
            ..Default::default()
        }];
        let module = crate::ir::module::Module::new();
        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();

        let mut v = ClosureVersion::new(FunId(1), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let cls = b.add(Tag::MkFunCls { fun: FunId(0) }, vec![env]);
        // g(b = TRUE, FALSE) — named argument goes to slot 1
        let call = b.add(
            Tag::NamedCall { names: vec![Some(Symbol(11)), None], has_fs: false },
            vec![cls, Value::True, Value::False, env],
        );
        b.add(Tag::Return, vec![call]);

        let mut pctx = PassCtx {
            module: &module,
            functions: &functions,
            pool: &mut pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        assert!(MatchCallArgs.run(&mut v, &mut pctx));

        let mut found = false;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if let Tag::Call { nargs, .. } = v.code.instr(*id).tag {
                    assert_eq!(nargs, 2);
                    let args = v.code.instr(*id).call_args();
                    assert_eq!(args, &[Value::False, Value::True]);
                    found = true;
                }
            }
        });
        assert!(found);
    }
}
