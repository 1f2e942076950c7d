//! Speculation lowering.
//!
//! Every `Assume` becomes an explicit branch: the surviving side continues,
//! the failing side jumps to its checkpoint's deopt block. Checkpoints
//! themselves degrade to fall-through. `Deopt` instructions are rewritten to
//! `ScheduledDeopt` carrying the flattened frame list, outermost caller
//! first, as the interpreter's deopt opcode expects.

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::CompilerConfig;
use crate::ir::code::Code;
use crate::ir::tag::{FrameShape, Tag};
use crate::ir::value::{InstrId, Value};

pub fn lower_speculation(code: &mut Code, _config: &CompilerConfig, rng: &mut Option<StdRng>) {
    lower_assumes(code, rng);
    lower_checkpoints(code);
    schedule_deopts(code);
}

fn lower_assumes(code: &mut Code, rng: &mut Option<StdRng>) {
    loop {
        let mut found = None;
        'search: for bb in code.bb_ids() {
            for (pos, id) in code.bb(bb).instrs.iter().enumerate() {
                if matches!(code.instr(*id).tag, Tag::Assume { .. }) {
                    found = Some((bb, pos, *id));
                    break 'search;
                }
            }
        }
        let Some((bb, pos, id)) = found else { break };

        let Tag::Assume { not, .. } = code.instr(id).tag else { unreachable!() };
        let cond = code.instr(id).args[0];
        let cp = code.instr(id).args[1];

        // The checkpoint's deopt block is the failure target
        let deopt_bb = match cp {
            Value::Instr(cp_id) => code.bb(code.instr(cp_id).bb).next1,
            _ => None,
        };
        let Some(deopt_bb) = deopt_bb else {
            // No checkpoint to fail into: the assumption is unenforceable,
            // drop it
            code.remove_at(bb, pos);
            continue;
        };

        // Split so the assume's tail continues on the surviving side
        let tail = code.split(bb, pos);
        code.remove_at(tail, 0);
        code.push(bb, Tag::Branch, vec![cond]);

        let mut fail_on_false = !not;
        if let Some(rng) = rng {
            // Chaos mode: randomly take the deopt path to exercise it
            if rng.gen_bool(0.5) {
                fail_on_false = !fail_on_false;
            }
        }
        if fail_on_false {
            code.bb_mut(bb).next0 = Some(tail);
            code.bb_mut(bb).next1 = Some(deopt_bb);
        } else {
            code.bb_mut(bb).next0 = Some(deopt_bb);
            code.bb_mut(bb).next1 = Some(tail);
        }
    }
}

fn lower_checkpoints(code: &mut Code) {
    for bb in code.bb_ids() {
        let Some(last) = code.bb(bb).last() else { continue };
        if !matches!(code.instr(last).tag, Tag::Checkpoint) {
            continue;
        }
        let pos = code.bb(bb).instrs.len() - 1;
        code.remove_at(bb, pos);
        // Fall through to the surviving branch; the deopt block stays
        // reachable through the lowered assumes
        code.bb_mut(bb).next1 = None;
    }
}

fn schedule_deopts(code: &mut Code) {
    for bb in code.bb_ids() {
        let Some(last) = code.bb(bb).last() else { continue };
        if !matches!(code.instr(last).tag, Tag::Deopt) {
            continue;
        }
        let fs = code.instr(last).args[0];
        let Value::Instr(mut fs_id) = fs else { continue };

        // Innermost frame first; parents chain outward
        let mut chain: Vec<InstrId> = vec![fs_id];
        while let Some(parent) = code.instr(fs_id).frame_state() {
            let Value::Instr(p) = parent else { break };
            chain.push(p);
            fs_id = p;
        }
        // Outermost caller first
        chain.reverse();

        let mut frames = Vec::with_capacity(chain.len());
        let mut args = Vec::new();
        for f in &chain {
            let Tag::FrameState { code: cref, pc, stack_len, in_promise, .. } =
                code.instr(*f).tag
            else {
                continue;
            };
            frames.push(FrameShape { code: cref, pc, stack_len, in_promise });
            // Per frame: the captured stack, then the environment
            let fargs = code.instr(*f).args.clone();
            args.extend_from_slice(&fargs[..stack_len + 1]);
        }

        let pos = code.bb(bb).instrs.len() - 1;
        code.replace_at(bb, pos, Tag::ScheduledDeopt { frames }, args);
    }
}
