//! IR verifier.
//!
//! Checks the invariants every pass must preserve:
//! - block shape matches its last instruction (branch/jump/exit)
//! - phis sit at block starts, one input per predecessor
//! - every use is dominated by its definition
//! - every `Assume` names a `Checkpoint` whose deopt branch ends in `Deopt`
//! - no edge references a deleted instruction

use thiserror::Error;

use super::bb::BBId;
use super::code::Code;
use super::tag::Tag;
use super::value::{InstrId, Value};
use super::version::ClosureVersion;
use crate::cfg::{DominanceGraph, CFG};
use crate::visitor::Visitor;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("block {0} ends in {1} but has the wrong successor shape")]
    BadShape(u32, &'static str),
    #[error("phi %{0} is not at the start of its block")]
    PhiNotAtStart(u32),
    #[error("phi %{0} input count does not match its arguments")]
    PhiArity(u32),
    #[error("phi %{0} names {1} which is not a predecessor")]
    PhiInputNotPred(u32, u32),
    #[error("use of %{0} in %{1} is not dominated by its definition")]
    UseNotDominated(u32, u32),
    #[error("assume %{0} does not guard a checkpoint with a deopt branch")]
    BadAssume(u32),
    #[error("%{0} references deleted instruction %{1}")]
    DeletedRef(u32, u32),
    #[error("block ids are not contiguous from 0")]
    NonContiguousIds,
}

/// Verify one code unit.
pub fn verify_code(code: &Code) -> Result<(), VerifyError> {
    let cfg = CFG::new(code);
    let dom = DominanceGraph::new(code, &cfg);

    let mut result = Ok(());
    Visitor::run(code, |bb| {
        if result.is_err() {
            return;
        }
        result = verify_bb(code, &cfg, &dom, bb);
    });
    result
}

fn verify_bb(code: &Code, cfg: &CFG, dom: &DominanceGraph, bb: BBId) -> Result<(), VerifyError> {
    let block = code.bb(bb);

    // Shape
    if let Some(last) = block.last() {
        let tag = &code.instr(last).tag;
        if tag.is_branching() && !block.is_branch() {
            return Err(VerifyError::BadShape(bb.0, tag.name()));
        }
        if tag.is_exit() && !block.is_exit() {
            return Err(VerifyError::BadShape(bb.0, tag.name()));
        }
    }
    if block.is_branch() {
        match block.last().map(|l| &code.instr(l).tag) {
            Some(t) if t.is_branching() => {}
            _ => return Err(VerifyError::BadShape(bb.0, "branch-without-branching-last")),
        }
    }

    for (pos, id) in block.instrs.iter().enumerate() {
        let instr = code.instr(*id);

        // Phi placement and inputs
        if let Tag::Phi { inputs } = &instr.tag {
            let leading_phis = block
                .instrs
                .iter()
                .take_while(|i| code.instr(**i).is_phi())
                .count();
            if pos >= leading_phis {
                return Err(VerifyError::PhiNotAtStart(id.0));
            }
            if inputs.len() != instr.args.len() {
                return Err(VerifyError::PhiArity(id.0));
            }
            for input in inputs {
                if !cfg.preds(bb).contains(input) && !cfg.transitive_preds(bb).contains(input) {
                    return Err(VerifyError::PhiInputNotPred(id.0, input.0));
                }
            }
        }

        // Edges
        for arg in &instr.args {
            if let Value::Instr(def) = arg {
                if code.instr(*def).deleted {
                    return Err(VerifyError::DeletedRef(id.0, def.0));
                }
                if !instr.is_phi() && !dominated_use(code, dom, *def, *id, pos, bb) {
                    return Err(VerifyError::UseNotDominated(def.0, id.0));
                }
            }
        }

        // Checkpoint discipline
        if let Tag::Assume { .. } = instr.tag {
            let ok = match instr.args.get(1) {
                Some(Value::Instr(cp)) => checkpoint_has_deopt(code, *cp),
                _ => false,
            };
            if !ok {
                return Err(VerifyError::BadAssume(id.0));
            }
        }
    }
    Ok(())
}

fn dominated_use(
    code: &Code,
    dom: &DominanceGraph,
    def: InstrId,
    _use_instr: InstrId,
    use_pos: usize,
    use_bb: BBId,
) -> bool {
    let def_bb = code.instr(def).bb;
    if def_bb == use_bb {
        let block = code.bb(use_bb);
        let def_pos = block.instrs.iter().position(|i| *i == def);
        return match def_pos {
            Some(d) => d < use_pos,
            None => false,
        };
    }
    dom.dominates(def_bb, use_bb)
}

fn checkpoint_has_deopt(code: &Code, cp: InstrId) -> bool {
    let instr = code.instr(cp);
    if !matches!(instr.tag, Tag::Checkpoint) {
        return false;
    }
    let Some(deopt_bb) = code.bb(instr.bb).next1 else { return false };
    // The deopt branch may go through RecordDeoptReason blocks first
    for bb in code.reachable_from(deopt_bb) {
        if let Some(last) = code.bb(bb).last() {
            if matches!(code.instr(last).tag, Tag::Deopt | Tag::ScheduledDeopt { .. }) {
                return true;
            }
        }
    }
    false
}

/// Verify a whole version: body plus live promises.
pub fn verify(version: &ClosureVersion) -> Result<(), VerifyError> {
    verify_code(&version.code)?;
    for id in version.promise_ids() {
        if let Some(p) = version.promise(id) {
            verify_code(&p.code)?;
        }
    }
    Ok(())
}

/// Check that block ids are contiguous from 0 (after a renumbering pass).
pub fn verify_contiguous_ids(code: &Code) -> Result<(), VerifyError> {
    let ids = code.bb_ids();
    for (i, id) in ids.iter().enumerate() {
        if id.0 != i as u32 {
            return Err(VerifyError::NonContiguousIds);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tag::{DeoptReason, Tag};
    use tarn_bytecode::module::{CodeRef, FunId, WhichCode};

    fn code_ref() -> CodeRef {
        CodeRef { fun: FunId(0), which: WhichCode::Body }
    }

    #[test]
    fn test_valid_straight_line() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let a = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        code.push(bb, Tag::Return, vec![Value::Instr(a)]);
        assert_eq!(verify_code(&code), Ok(()));
    }

    #[test]
    fn test_use_before_def_rejected() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        // Allocate the arg after its use by inserting in front
        let a = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        let ret = code.push(bb, Tag::Return, vec![Value::Instr(a)]);
        // Move the definition after the use
        code.move_instr(a, bb, 2);
        let _ = ret;
        assert!(matches!(verify_code(&code), Err(VerifyError::UseNotDominated(..))));
    }

    #[test]
    fn test_assume_requires_checkpoint() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);

        // A proper checkpoint with a deopt branch
        let cont = code.new_bb();
        let deopt_bb = code.new_bb();
        let cp = code.push(bb, Tag::Checkpoint, vec![]);
        code.bb_mut(bb).next0 = Some(cont);
        code.bb_mut(bb).next1 = Some(deopt_bb);
        let fs = code.push(
            deopt_bb,
            Tag::FrameState { code: code_ref(), pc: 0, stack_len: 0, in_promise: false, has_parent: false },
            vec![Value::BaseEnv],
        );
        code.push(deopt_bb, Tag::Deopt, vec![Value::Instr(fs)]);

        code.push(
            cont,
            Tag::Assume { not: false, reason: DeoptReason::Unknown },
            vec![Value::True, Value::Instr(cp)],
        );
        code.push(cont, Tag::Return, vec![Value::Nil]);
        assert_eq!(verify_code(&code), Ok(()));

        // Breaking the deopt branch is caught
        let deopt_instr = code.bb(deopt_bb).last().unwrap();
        code.remove_instr(deopt_instr);
        assert!(matches!(verify_code(&code), Err(VerifyError::BadAssume(_))));
    }

    #[test]
    fn test_phi_input_must_be_pred() {
        let mut code = Code::new();
        let a = code.new_bb();
        let b = code.new_bb();
        let m = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        code.push(a, Tag::Branch, vec![Value::True]);
        code.bb_mut(a).next0 = Some(b);
        code.bb_mut(a).next1 = Some(m);
        code.bb_mut(b).next0 = Some(m);

        let phi = code.push(
            m,
            Tag::Phi { inputs: vec![b, a] },
            vec![Value::True, Value::False],
        );
        code.push(m, Tag::Return, vec![Value::Instr(phi)]);
        assert_eq!(verify_code(&code), Ok(()));

        // An input from an unrelated block is rejected
        let unrelated = code.new_bb();
        if let Tag::Phi { inputs } = &mut code.instr_mut(phi).tag {
            inputs[0] = unrelated;
        }
        assert!(matches!(verify_code(&code), Err(VerifyError::PhiInputNotPred(..))));
    }

    #[test]
    fn test_contiguous_ids() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        assert_eq!(verify_contiguous_ids(&code), Ok(()));
        code.bb_mut(bb).deleted = true;
        let tail = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(tail);
        assert!(verify_contiguous_ids(&code).is_err());
        code.renumber_bbs();
        assert_eq!(verify_contiguous_ids(&code), Ok(()));
    }
}
