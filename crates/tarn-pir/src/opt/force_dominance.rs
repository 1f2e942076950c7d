//! Force dominance.
//!
//! Forcing is idempotent: only the first force of a promise on any path can
//! run code. A forward analysis maps each value to the unique force that
//! first forced it, or to "ambiguous" where paths disagree. Dominated forces
//! collapse into their dominator's result; the unique dominating force of a
//! lazy argument is where its promise body gets spliced inline.

use rustc_hash::FxHashMap;

use super::{Pass, PassCtx};
use crate::analysis::framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forced {
    At(InstrId),
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct ForcedAt {
    map: FxHashMap<Value, Forced>,
}

impl AbstractState for ForcedAt {
    fn merge(&mut self, other: &Self) -> AbstractRes {
        let mut res = AbstractRes::None;
        for (v, f) in self.map.iter_mut() {
            if *f != Forced::Ambiguous && other.map.get(v) != Some(f) {
                *f = Forced::Ambiguous;
                res = AbstractRes::Updated;
            }
        }
        for (v, _) in other.map.iter() {
            if !self.map.contains_key(v) {
                self.map.insert(*v, Forced::Ambiguous);
                res = AbstractRes::Updated;
            }
        }
        res
    }
}

struct ForceAnalysis;

impl Analysis for ForceAnalysis {
    type State = ForcedAt;

    fn init(&self, _code: &Code) -> ForcedAt {
        ForcedAt::default()
    }

    fn apply(&self, state: &mut ForcedAt, code: &Code, id: InstrId) {
        if matches!(code.instr(id).tag, Tag::Force { .. }) {
            let val = code.instr(id).args[0].followed(code);
            state.map.entry(val).or_insert(Forced::At(id));
        }
    }

    fn segment_after(&self, _code: &Code, _id: InstrId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Verdict {
    /// The first force of its value on every incoming path
    Dominating,
    DominatedBy(InstrId),
}

pub struct ForceDominance;

impl Pass for ForceDominance {
    fn name(&self) -> &'static str {
        "force-dominance"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let ClosureVersion { code, promises, .. } = version;

        let fp = FixedPoint::run(ForceAnalysis, code);
        let mut verdicts: Vec<(InstrId, Verdict)> = Vec::new();
        fp.foreach_before(code, |state, id| {
            if !matches!(code.instr(id).tag, Tag::Force { .. }) {
                return;
            }
            let val = code.instr(id).args[0].followed(code);
            match state.map.get(&val) {
                // Not yet forced here: this is the first force
                None => verdicts.push((id, Verdict::Dominating)),
                Some(Forced::At(o)) if *o == id => verdicts.push((id, Verdict::Dominating)),
                Some(Forced::At(o)) => verdicts.push((id, Verdict::DominatedBy(*o))),
                Some(Forced::Ambiguous) => {}
            }
        });

        // Every force per forced value, to decide whether a splice is safe:
        // inlining is only correct when all other forces of the same promise
        // are dominated by the inlining one, otherwise the promise could run
        // twice
        let mut forces_of: FxHashMap<Value, Vec<InstrId>> = FxHashMap::default();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if matches!(code.instr(*id).tag, Tag::Force { .. }) {
                    let val = code.instr(*id).args[0].followed(code);
                    forces_of.entry(val).or_default().push(*id);
                }
            }
        });
        let verdict_of: FxHashMap<InstrId, Verdict> = verdicts.iter().copied().collect();
        let splice_safe = |target: &Value, dominator: InstrId| -> bool {
            forces_of.get(target).map_or(false, |all| {
                all.iter().all(|f| {
                    *f == dominator || verdict_of.get(f) == Some(&Verdict::DominatedBy(dominator))
                })
            })
        };

        let mut changed = false;
        // Result each removed force was replaced with
        let mut replaced: FxHashMap<InstrId, Value> = FxHashMap::default();

        for (f, verdict) in &verdicts {
            if *verdict != Verdict::Dominating || code.instr(*f).deleted {
                continue;
            }
            let target = code.instr(*f).args[0].followed(code);
            let Value::Instr(m) = target else { continue };
            let Tag::MkArg { prom } = code.instr(m).tag else { continue };

            let eager = code.instr(m).args[0];
            if eager != Value::Missing {
                // The argument's value is already known
                code.replace_uses_with(*f, eager);
                code.remove_instr(*f);
                replaced.insert(*f, eager);
                changed = true;
                continue;
            }

            if !splice_safe(&target, *f) {
                continue;
            }

            // Unique dominating force of a lazy argument: splice the promise
            let Some(promise) = promises.get(prom) else { continue };
            let prom_code = promise.code.clone();
            let env = code.instr(m).args[1];

            let bb = code.instr(*f).bb;
            let Some(pos) = code.bb(bb).instrs.iter().position(|i| i == f) else { continue };
            let tail = code.split(bb, pos);

            let map = code.clone_from(&prom_code);
            for (_, cloned) in map.instrs.iter() {
                if matches!(code.instr(*cloned).tag, Tag::LdFunctionEnv) {
                    code.replace_uses_with(*cloned, env);
                    code.remove_instr(*cloned);
                }
            }
            code.bb_mut(bb).next0 = Some(map.entry);
            let result = code.inline_returns(map.entry, tail);

            code.replace_uses_with(*f, result);
            // The force sits at the head of the tail block now
            let fpos = code.bb(tail).instrs.iter().position(|i| i == f);
            if let Some(fpos) = fpos {
                code.remove_at(tail, fpos);
            }
            replaced.insert(*f, result);
            changed = true;
        }

        for (f, verdict) in &verdicts {
            let Verdict::DominatedBy(o) = verdict else { continue };
            if code.instr(*f).deleted {
                continue;
            }
            let replacement = replaced.get(o).copied().unwrap_or(Value::Instr(*o));
            code.replace_uses_with(*f, replacement);
            code.remove_instr(*f);
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
    use tarn_bytecode::module::{CodeRef, Formals, FunId, PoolIdx, WhichCode};
    use tarn_bytecode::Symbol;

    fn run(version: &mut ClosureVersion) -> bool {
        let module = crate::ir::module::Module::new();
        let functions = Vec::new();
        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();
        let mut ctx = PassCtx {
            module: &module,
            functions: &functions,
            pool: &mut pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        ForceDominance.run(version, &mut ctx)
    }

    #[test]
    fn test_nested_force_collapses() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let ld = b.add(Tag::LdVar { name: Symbol(9) }, vec![env]);
        let f1 = b.add(Tag::Force { has_fs: false }, vec![ld]);
        let f2 = b.add(Tag::Force { has_fs: false }, vec![f1]);
        b.add(Tag::Return, vec![f2]);

        assert!(run(&mut v));
        let mut forces = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::Force { .. }) {
                    forces += 1;
                }
            }
        });
        assert_eq!(forces, 1);
    }

    #[test]
    fn test_eager_mkarg_force_replaced() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let prom = v.create_promise(
            CodeRef { fun: FunId(0), which: WhichCode::Promise(0) },
            Code::new(),
        );
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let c = b.add(Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        let arg = b.add(Tag::MkArg { prom }, vec![c, env]);
        let f = b.add(Tag::Force { has_fs: false }, vec![arg]);
        b.add(Tag::Return, vec![f]);

        assert!(run(&mut v));
        assert!(crate::query::returns(&v, |_, val| *val == c));
    }

    #[test]
    fn test_lazy_promise_spliced_at_unique_force() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());

        // The promise body stores into its environment, so it is not pure
        let mut prom_code = Code::new();
        {
            let mut pb = Builder::promise(&mut prom_code);
            let penv = pb.env;
            pb.add(Tag::StVar { name: Symbol(5) }, vec![Value::True, penv]);
            pb.add(Tag::Return, vec![Value::False]);
        }
        let prom = v.create_promise(
            CodeRef { fun: FunId(0), which: WhichCode::Promise(0) },
            prom_code,
        );

        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let arg = b.add(Tag::MkArg { prom }, vec![Value::Missing, env]);
        let f = b.add(Tag::Force { has_fs: false }, vec![arg]);
        b.add(Tag::Return, vec![f]);

        assert!(run(&mut v));
        assert_eq!(crate::ir::verify::verify_code(&v.code), Ok(()));
        // The promise's store now sits in the caller, against the caller env
        let mut store_env = None;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::StVar { .. }) {
                    store_env = Some(v.code.instr(*id).args[1]);
                }
            }
        });
        assert_eq!(store_env, Some(env));
        assert!(crate::query::returns(&v, |_, val| *val == Value::False));
        assert!(!crate::query::has_instr(&v, "force"));
    }

    #[test]
    fn test_ambiguous_force_not_inlined() {
        // One branch forces, the merge forces again: neither is unique
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut prom_code = Code::new();
        {
            let mut pb = Builder::promise(&mut prom_code);
            let penv = pb.env;
            pb.add(Tag::StVar { name: Symbol(5) }, vec![Value::True, penv]);
            pb.add(Tag::Return, vec![Value::False]);
        }
        let prom = v.create_promise(
            CodeRef { fun: FunId(0), which: WhichCode::Promise(0) },
            prom_code,
        );

        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let arg = b.add(Tag::MkArg { prom }, vec![Value::Missing, env]);
        let c = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(c.as_instr().unwrap()).ty = crate::ir::ty::PirType::test();
        let t = b.create_bb();
        let merge = b.create_bb();
        b.branch(c, t, merge);
        b.seek(t);
        b.add(Tag::Force { has_fs: false }, vec![arg]);
        b.jump(merge);
        b.seek(merge);
        let f2 = b.add(Tag::Force { has_fs: false }, vec![arg]);
        b.add(Tag::Return, vec![f2]);

        run(&mut v);
        // The merge force cannot know whether the promise already ran, so
        // nothing was spliced into the body
        assert!(crate::query::has_instr(&v, "force"));
        let mut body_stores = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::StVar { .. }) {
                    body_stores += 1;
                }
            }
        });
        assert_eq!(body_stores, 0);
    }
}
