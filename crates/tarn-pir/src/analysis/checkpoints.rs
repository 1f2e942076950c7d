//! Available-checkpoint analysis.
//!
//! Tracks, at each program point, the most recent checkpoint the optimizer
//! may still deopt through. A checkpoint stops being available once an
//! observable effect has happened: rolling back past it would lose the
//! effect.

use super::framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
use crate::ir::code::Code;
use crate::ir::effects::Effects;
use crate::ir::tag::Tag;
use crate::ir::value::InstrId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AvailableCp(pub Option<InstrId>);

impl AbstractState for AvailableCp {
    fn merge(&mut self, other: &Self) -> AbstractRes {
        if self.0.is_some() && self.0 != other.0 {
            self.0 = None;
            AbstractRes::Updated
        } else {
            AbstractRes::None
        }
    }
}

pub struct CheckpointAnalysis;

/// Whether a deopt may not roll back across this instruction. Reads and
/// forces are replay-safe (promises cache their value); writes, leaks,
/// warnings, and anything that can run user code are not.
fn pins(instr: &crate::ir::instr::Instr) -> bool {
    match &instr.tag {
        Tag::Force { .. } | Tag::LdFun { .. } | Tag::LdVar { .. } | Tag::LdVarSuper { .. } => {
            false
        }
        t if t.is_call() => true,
        _ => instr.effects.intersects(
            Effects::WRITES_ENV | Effects::LEAKS_ENV | Effects::EXECUTES_CODE | Effects::WARN,
        ),
    }
}

impl Analysis for CheckpointAnalysis {
    type State = AvailableCp;

    fn init(&self, _code: &Code) -> AvailableCp {
        AvailableCp(None)
    }

    fn apply(&self, state: &mut AvailableCp, code: &Code, id: InstrId) {
        let instr = code.instr(id);
        match instr.tag {
            Tag::Checkpoint => state.0 = Some(id),
            _ => {
                if pins(instr) {
                    state.0 = None;
                }
            }
        }
    }

    fn segment_after(&self, _code: &Code, _id: InstrId) -> bool {
        false
    }
}

/// Finished checkpoint availability with point queries.
pub struct AvailableCheckpoints {
    fp: FixedPoint<CheckpointAnalysis>,
}

impl AvailableCheckpoints {
    pub fn compute(code: &Code) -> AvailableCheckpoints {
        AvailableCheckpoints { fp: FixedPoint::run(CheckpointAnalysis, code) }
    }

    /// The checkpoint available just before `id`.
    pub fn at(&self, code: &Code, id: InstrId) -> Option<InstrId> {
        self.fp.before(code, id).0
    }

    /// The next checkpoint after `id`, reachable without crossing a pinning
    /// effect or a merge.
    pub fn next(&self, code: &Code, id: InstrId) -> Option<InstrId> {
        let bb = code.instr(id).bb;
        let instrs = &code.bb(bb).instrs;
        let pos = instrs.iter().position(|i| *i == id)?;
        let mut cur_bb = bb;
        let mut idx = pos + 1;
        loop {
            let list = &code.bb(cur_bb).instrs;
            while idx < list.len() {
                let i = list[idx];
                match code.instr(i).tag {
                    Tag::Checkpoint => return Some(i),
                    _ if pins(code.instr(i)) => return None,
                    _ => idx += 1,
                }
            }
            // Follow a straight-line jump
            let block = code.bb(cur_bb);
            match (block.next0, block.next1) {
                (Some(next), None) => {
                    cur_bb = next;
                    idx = 0;
                }
                _ => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::Value;
    use tarn_bytecode::Symbol;

    #[test]
    fn test_checkpoint_available_until_effect() {
        let mut code = Code::new();
        let a = code.new_bb();
        let cont = code.new_bb();
        let deopt = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        let cp = code.push(a, Tag::Checkpoint, vec![]);
        code.bb_mut(a).next0 = Some(cont);
        code.bb_mut(a).next1 = Some(deopt);

        let pure1 = code.push(cont, Tag::LdArg { index: 0 }, vec![]);
        let st = code.push(cont, Tag::StVar { name: Symbol(3) }, vec![Value::True, Value::BaseEnv]);
        let pure2 = code.push(cont, Tag::LdArg { index: 1 }, vec![]);
        code.push(cont, Tag::Return, vec![Value::Instr(pure2)]);

        let cps = AvailableCheckpoints::compute(&code);
        assert_eq!(cps.at(&code, pure1), Some(cp));
        assert_eq!(cps.at(&code, st), Some(cp));
        // The store pins execution; the checkpoint is gone afterwards
        assert_eq!(cps.at(&code, pure2), None);
    }

    #[test]
    fn test_next_follows_jumps() {
        let mut code = Code::new();
        let a = code.new_bb();
        let b = code.new_bb();
        let cont = code.new_bb();
        let deopt = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        let force = code.push(a, Tag::LdArg { index: 0 }, vec![]);
        code.bb_mut(a).next0 = Some(b);
        let cp = code.push(b, Tag::Checkpoint, vec![]);
        code.bb_mut(b).next0 = Some(cont);
        code.bb_mut(b).next1 = Some(deopt);
        code.push(cont, Tag::Return, vec![Value::Nil]);

        let cps = AvailableCheckpoints::compute(&code);
        assert_eq!(cps.next(&code, force), Some(cp));
    }
}
