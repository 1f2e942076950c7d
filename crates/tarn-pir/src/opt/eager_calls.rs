//! Eager-call conversion.
//!
//! A static call whose target version advertises `IsEager` evaluates all its
//! arguments anyway, so lazy arguments can be forced at the call site. The
//! call's context gains the eager bits and the driver is asked for the
//! sharper version.

use super::{Pass, PassCtx};
use crate::frontend::CompileRequest;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::{ClosureVersion, VersionProperties};

pub struct EagerCalls;

impl Pass for EagerCalls {
    fn name(&self) -> &'static str {
        "eager-calls"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;

        // Static calls to eager targets, with the lazy argument positions
        let mut sites: Vec<(InstrId, Vec<usize>)> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                let Tag::StaticCall { fun, .. } = instr.tag else { continue };
                let Some(cls) = ctx.module.closure_for_fun(fun) else { continue };
                let dispatch = &ctx.module.closure(cls).dispatch;
                let eager = dispatch.indices().any(|i| {
                    dispatch
                        .version(i)
                        .map(|v| v.properties.contains(VersionProperties::IS_EAGER))
                        .unwrap_or(false)
                });
                if !eager {
                    continue;
                }
                let lazy: Vec<usize> = instr
                    .call_args()
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.ty(code).maybe_lazy())
                    .map(|(i, _)| i)
                    .collect();
                if !lazy.is_empty() {
                    sites.push((*id, lazy));
                }
            }
        });

        let changed = !sites.is_empty();
        for (id, lazy) in sites {
            let bb = code.instr(id).bb;
            let pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();
            for slot in lazy {
                let arg = code.instr(id).call_args()[slot];
                let forced = code.insert_at(bb, pos, Tag::Force { has_fs: false }, vec![arg]);
                code.update_type_and_effects(forced);
                code.instr_mut(id).args[slot] = Value::Instr(forced);
            }
            if let Tag::StaticCall { fun, ctx: call_ctx, nargs, .. } = &mut code.instr_mut(id).tag
            {
                for i in 0..*nargs {
                    call_ctx.set_eager(i);
                }
                ctx.requests.push(CompileRequest { fun: *fun, ctx: *call_ctx });
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::module::Module;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{Formals, FunId};

    #[test]
    fn test_lazy_args_forced_for_eager_target() {
        let functions = vec![
            tarn_bytecode::BcFunction::default(),
            tarn_bytecode::BcFunction::default(),
        ];
        let mut module = Module::new();
        let cls = module.get_or_declare(FunId(0), "g", Formals::new(vec![tarn_bytecode::Symbol(9)]));
        let idx = module.closure_mut(cls).dispatch.declare(FunId(0), Context::minimal());
        module
            .closure_mut(cls)
            .dispatch
            .version_mut(idx)
            .unwrap()
            .properties |= VersionProperties::IS_EAGER;

        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();

        let mut v = ClosureVersion::new(FunId(1), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let lazy = b.add(Tag::LdVar { name: tarn_bytecode::Symbol(5) }, vec![env]);
        let call = b.add(
            Tag::StaticCall { fun: FunId(0), ctx: Context::minimal(), nargs: 1, has_fs: false },
            vec![lazy, env],
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
        assert!(EagerCalls.run(&mut v, &mut pctx));
        assert!(crate::query::has_instr(&v, "force"));
        assert!(requests.iter().any(|r| r.ctx.is_eager(0)));
    }
}
