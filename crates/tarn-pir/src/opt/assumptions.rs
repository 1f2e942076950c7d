//! Assumption optimization.
//!
//! An assumption dominated by an identical assumption is redundant; once the
//! first one held, the second cannot fail. Assumptions whose condition the
//! type system already proves fold in constant folding; this pass only
//! handles the dominance form.

use rustc_hash::FxHashMap;

use super::{Pass, PassCtx};
use crate::cfg::{DominanceGraph, CFG};
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;
use crate::visitor::DominatorTreeVisitor;

pub struct OptimizeAssumptions;

impl Pass for OptimizeAssumptions {
    fn name(&self) -> &'static str {
        "assumption-opt"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cfg = CFG::new(code);
        let dom = DominanceGraph::new(code, &cfg);

        // (condition, polarity) -> first assumption seen in dominance order
        let mut seen: FxHashMap<(Value, bool), InstrId> = FxHashMap::default();
        let mut redundant: Vec<InstrId> = Vec::new();

        DominatorTreeVisitor::run(&dom, |bb| {
            for id in &code.bb(bb).instrs {
                let Tag::Assume { not, .. } = code.instr(*id).tag else { continue };
                let key = (code.instr(*id).args[0], not);
                match seen.get(&key) {
                    Some(prev) if dom.dominates(code.instr(*prev).bb, bb) => {
                        redundant.push(*id);
                    }
                    _ => {
                        seen.insert(key, *id);
                    }
                }
            }
        });

        let changed = !redundant.is_empty();
        for id in redundant {
            code.remove_instr(id);
        }
        changed
    }
}
