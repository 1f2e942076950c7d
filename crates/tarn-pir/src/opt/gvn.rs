//! Global value numbering.
//!
//! Effect-free instructions computing the same operation over the same
//! operands collapse into the dominating occurrence. Keys are structural;
//! instructions carrying feedback or control roles (phis, checkpoints,
//! arguments) are left alone.

use rustc_hash::FxHashMap;

use super::{Pass, PassCtx};
use crate::cfg::{DominanceGraph, CFG};
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;
use crate::visitor::DominatorTreeVisitor;

pub struct Gvn;

impl Pass for Gvn {
    fn name(&self) -> &'static str {
        "gvn"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cfg = CFG::new(code);
        let dom = DominanceGraph::new(code, &cfg);

        // First occurrence of each structural key, visited in dominance
        // preorder so hits are definition-before-use candidates
        let mut seen: FxHashMap<String, InstrId> = FxHashMap::default();
        let mut replacements: Vec<(InstrId, InstrId)> = Vec::new();

        DominatorTreeVisitor::run(&dom, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                if !instr.effects.is_empty()
                    || !instr.produces_result()
                    || matches!(
                        instr.tag,
                        Tag::Phi { .. } | Tag::LdArg { .. } | Tag::Checkpoint | Tag::MkEnv { .. }
                            | Tag::MkArg { .. } | Tag::FrameState { .. } | Tag::LdFunctionEnv
                            | Tag::CastType { .. }
                    )
                {
                    continue;
                }
                let key = format!("{:?}|{:?}", instr.tag, instr.args);
                match seen.get(&key) {
                    Some(prev) if dom.dominates(code.instr(*prev).bb, bb) => {
                        replacements.push((*id, *prev));
                    }
                    _ => {
                        seen.insert(key, *id);
                    }
                }
            }
        });

        let changed = !replacements.is_empty();
        for (dup, keep) in replacements {
            code.replace_uses_with(dup, Value::Instr(keep));
            code.remove_instr(dup);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::ty::PirType;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::Formals;
    use tarn_bytecode::{FunId, PoolIdx};

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
        Gvn.run(version, &mut ctx)
    }

    #[test]
    fn test_duplicate_pure_op_merged() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let x = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(x.as_instr().unwrap()).ty = PirType::int().scalar().not_object();
        let a1 = b.add(Tag::Add, vec![x, x, Value::ElidedEnv]);
        b.code.update_type_and_effects(a1.as_instr().unwrap());
        let a2 = b.add(Tag::Add, vec![x, x, Value::ElidedEnv]);
        b.code.update_type_and_effects(a2.as_instr().unwrap());
        let sum = b.add(Tag::Mul, vec![a1, a2, Value::ElidedEnv]);
        b.add(Tag::Return, vec![sum]);

        assert!(run(&mut v));
        let mut adds = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::Add) {
                    adds += 1;
                }
            }
        });
        assert_eq!(adds, 1);
    }

    #[test]
    fn test_ldconst_dedup() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let c1 = b.add(Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        let c2 = b.add(Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        let sum = b.add(Tag::Add, vec![c1, c2, Value::ElidedEnv]);
        b.add(Tag::Return, vec![sum]);

        assert!(run(&mut v));
        let mut consts = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::LdConst { .. }) {
                    consts += 1;
                }
            }
        });
        assert_eq!(consts, 1);
    }
}
