//! Conventional SSA conversion.
//!
//! Splits critical edges so every phi input block is an immediate
//! predecessor with a single successor, then materializes each input as a
//! `PirCopy` at the end of its block. After this, a phi and its copies can
//! share one storage slot and the phi itself emits no code.

use crate::cfg::CFG;
use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};

pub fn convert(code: &mut Code) {
    split_critical_edges(code);
    insert_copies(code);
}

fn split_critical_edges(code: &mut Code) {
    loop {
        let cfg = CFG::new(code);
        let mut split = None;
        'search: for bb in code.bb_ids() {
            let has_phi = code.bb(bb).instrs.iter().any(|i| code.instr(*i).is_phi());
            if !has_phi {
                continue;
            }
            for p in cfg.preds(bb) {
                if code.bb(*p).is_branch() {
                    split = Some((*p, bb));
                    break 'search;
                }
            }
        }
        let Some((pred, target)) = split else { break };
        let mid = code.new_bb();
        code.bb_mut(mid).next0 = Some(target);
        code.bb_mut(pred).replace_successor(target, mid);
        code.relabel_phi_inputs(target, pred, mid);
    }
}

fn insert_copies(code: &mut Code) {
    let phis: Vec<InstrId> = {
        let mut out = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if code.instr(*id).is_phi() {
                    out.push(*id);
                }
            }
        });
        out
    };

    for phi in phis {
        let (inputs, args) = match &code.instr(phi).tag {
            Tag::Phi { inputs } => (inputs.clone(), code.instr(phi).args.clone()),
            _ => continue,
        };
        for (idx, (input_bb, value)) in inputs.iter().zip(args.iter()).enumerate() {
            // Append the copy before the block's terminator, if any
            let pos = copy_position(code, *input_bb);
            let copy = code.insert_at(*input_bb, pos, Tag::PirCopy, vec![*value]);
            code.update_type_and_effects(copy);
            // The phi now reads the copy
            code.instr_mut(phi).args[idx] = Value::Instr(copy);
        }
    }
}

fn copy_position(code: &Code, bb: BBId) -> usize {
    let block = code.bb(bb);
    match block.last() {
        Some(last) if code.instr(last).tag.is_branching() || code.instr(last).tag.is_exit() => {
            block.instrs.len() - 1
        }
        _ => block.instrs.len(),
    }
}
