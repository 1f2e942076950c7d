//! Visibility optimization.
//!
//! Only the last visibility marker before an observation point matters.
//! Within a block, a marker followed by another marker (or by a call, which
//! sets visibility itself) with nothing observing in between is dead.

use super::{Pass, PassCtx};
use crate::ir::effects::Effects;
use crate::ir::tag::Tag;
use crate::ir::value::InstrId;
use crate::ir::version::ClosureVersion;

pub struct OptimizeVisibility;

impl Pass for OptimizeVisibility {
    fn name(&self) -> &'static str {
        "visibility"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut dead: Vec<InstrId> = Vec::new();

        for bb in code.bb_ids() {
            let ids = code.bb(bb).instrs.clone();
            let mut pending: Option<InstrId> = None;
            for id in ids {
                let instr = code.instr(id);
                let is_marker = matches!(instr.tag, Tag::Visible | Tag::Invisible);
                if is_marker {
                    if let Some(prev) = pending {
                        dead.push(prev);
                    }
                    pending = Some(id);
                } else if instr.effects.contains(Effects::VISIBILITY) {
                    // Calls overwrite visibility themselves
                    if let Some(prev) = pending.take() {
                        dead.push(prev);
                    }
                } else if instr.tag.is_exit() || instr.tag.is_branching() {
                    pending = None;
                }
            }
        }

        let changed = !dead.is_empty();
        for id in dead {
            code.remove_instr(id);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::value::Value;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{Formals, FunId};

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
        OptimizeVisibility.run(version, &mut ctx)
    }

    #[test]
    fn test_overwritten_markers_dropped() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        b.add(Tag::Visible, vec![]);
        b.add(Tag::Invisible, vec![]);
        b.add(Tag::Visible, vec![]);
        b.add(Tag::Return, vec![Value::Nil]);

        assert!(run(&mut v));
        let mut markers = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::Visible | Tag::Invisible) {
                    markers += 1;
                }
            }
        });
        assert_eq!(markers, 1);
    }

    #[test]
    fn test_final_marker_kept() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        b.add(Tag::Invisible, vec![]);
        b.add(Tag::Return, vec![Value::Nil]);

        assert!(!run(&mut v));
        assert!(crate::query::has_instr(&v, "invisible"));
    }
}
