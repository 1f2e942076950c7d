//! Liveness and slot allocation.
//!
//! Every produced value either lives in a numbered local slot or is consumed
//! directly off the operand stack. Stack placement is only used for the
//! tight case the emitter can prove safe: a single use, by the immediately
//! following instruction, as its first staged operand. Slots are reused
//! greedily when a value's whole live range is block-local; anything that
//! crosses a block edge keeps its slot for the function's lifetime. A phi
//! and the edge copies feeding it share one slot, which is what makes the
//! phi itself free.

use rustc_hash::{FxHashMap, FxHashSet};

use super::LowerError;
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::visitor::BreadthFirstVisitor;

#[derive(Debug, Default)]
pub struct Allocation {
    pub slot_of: FxHashMap<InstrId, u16>,
    pub num_slots: u16,
    /// Values consumed directly off the stack, never stored
    pub on_stack: FxHashSet<InstrId>,
}

impl Allocation {
    pub fn slot(&self, id: InstrId) -> Option<u16> {
        self.slot_of.get(&id).copied()
    }
}

/// The operand values an instruction stages onto the stack, in push order.
/// Environment edges are established through `SetEnv`, frame states carry no
/// runtime value, and phis emit nothing.
pub fn staged_args(code: &Code, id: InstrId) -> Vec<Value> {
    let instr = code.instr(id);
    match &instr.tag {
        Tag::Phi { .. } | Tag::FrameState { .. } | Tag::Checkpoint | Tag::Nop
        | Tag::Unreachable | Tag::Visible | Tag::Invisible | Tag::LdConst { .. }
        | Tag::LdArg { .. } | Tag::LdFunctionEnv | Tag::MkFunCls { .. } => Vec::new(),
        Tag::LdVar { .. } | Tag::LdVarSuper { .. } | Tag::LdFun { .. } | Tag::Missing { .. } => {
            Vec::new()
        }
        Tag::MkEnv { names, .. } => {
            // Binding values, then the parent
            instr.args[..=names.len()].to_vec()
        }
        Tag::MkArg { .. } => {
            let eager = instr.args[0];
            if eager == Value::Missing {
                Vec::new()
            } else {
                vec![eager]
            }
        }
        Tag::ScheduledDeopt { frames } => {
            // Per frame: the captured stack values; environments are
            // rebuilt by the interpreter from the deopt metadata
            let mut out = Vec::new();
            let mut cursor = 0;
            for f in frames {
                out.extend_from_slice(&instr.args[cursor..cursor + f.stack_len]);
                cursor += f.stack_len + 1;
            }
            out
        }
        Tag::Deopt | Tag::Assume { .. } => Vec::new(),
        _ => {
            // Everything else stages its value arguments except the
            // environment and frame-state edges
            let env = instr.env_slot();
            let fs = instr.fs_slot();
            instr
                .args
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != env && Some(*i) != fs)
                .map(|(_, v)| *v)
                .collect()
        }
    }
}

/// Whether the instruction writes a result the emitter must place.
fn produces(code: &Code, id: InstrId) -> bool {
    let instr = code.instr(id);
    instr.produces_result()
        && !matches!(
            instr.tag,
            Tag::Checkpoint | Tag::FrameState { .. } | Tag::LdFunctionEnv
        )
}

pub fn allocate(code: &Code) -> Result<Allocation, LowerError> {
    let order = BreadthFirstVisitor::order(code);

    // Flattened emission order
    let mut flat: Vec<InstrId> = Vec::new();
    let mut index: FxHashMap<InstrId, usize> = FxHashMap::default();
    for bb in &order {
        for id in &code.bb(*bb).instrs {
            index.insert(*id, flat.len());
            flat.push(*id);
        }
    }

    // Phi groups share one representative slot
    let mut rep: FxHashMap<InstrId, InstrId> = FxHashMap::default();
    for id in &flat {
        if let Tag::Phi { .. } = &code.instr(*id).tag {
            for arg in &code.instr(*id).args {
                if let Value::Instr(copy) = arg {
                    rep.insert(*copy, *id);
                }
            }
        }
    }
    let rep_of = |id: InstrId| -> InstrId { rep.get(&id).copied().unwrap_or(id) };

    // Uses, keyed by definition
    let mut uses: FxHashMap<InstrId, Vec<InstrId>> = FxHashMap::default();
    for id in &flat {
        for arg in &code.instr(*id).args {
            if let Value::Instr(def) = arg {
                uses.entry(*def).or_default().push(*id);
            }
        }
    }

    // Stack placement: single use by the very next instruction, as its
    // first staged operand
    let mut on_stack: FxHashSet<InstrId> = FxHashSet::default();
    for (pos, id) in flat.iter().enumerate() {
        if !produces(code, *id) || rep.contains_key(id) || code.instr(*id).is_phi() {
            continue;
        }
        // ForSeqSize leaves the sequence underneath its result
        if matches!(code.instr(*id).tag, Tag::ForSeqSize) {
            continue;
        }
        let Some(us) = uses.get(id) else { continue };
        if us.len() != 1 {
            continue;
        }
        let user = us[0];
        if index.get(&user) != Some(&(pos + 1)) || code.instr(user).bb != code.instr(*id).bb {
            continue;
        }
        if code.instr(user).is_phi() {
            continue;
        }
        if staged_args(code, user).first() == Some(&Value::Instr(*id)) {
            on_stack.insert(*id);
        }
    }

    // Greedy slot assignment over the flat order. Block-local ranges free
    // their slot at the last use; anything else is pinned.
    let mut last_use_in_bb: FxHashMap<InstrId, Option<usize>> = FxHashMap::default();
    for id in &flat {
        if !produces(code, *id) {
            continue;
        }
        let def_bb = code.instr(*id).bb;
        let all = uses.get(id);
        let block_local = all
            .map(|us| us.iter().all(|u| code.instr(*u).bb == def_bb))
            .unwrap_or(true);
        let pinned = rep.contains_key(id) || code.instr(*id).is_phi();
        if block_local && !pinned {
            let last = all
                .and_then(|us| us.iter().filter_map(|u| index.get(u)).max())
                .copied();
            last_use_in_bb.insert(*id, last);
        } else {
            last_use_in_bb.insert(*id, None);
        }
    }

    let mut allocation = Allocation::default();
    let mut free: Vec<u16> = Vec::new();
    let mut next = 0u16;
    // (release position, slot)
    let mut releases: Vec<(usize, u16)> = Vec::new();

    for (pos, id) in flat.iter().enumerate() {
        // Return expired slots
        releases.retain(|(at, slot)| {
            if *at < pos {
                free.push(*slot);
                false
            } else {
                true
            }
        });

        if !produces(code, *id) || on_stack.contains(id) {
            continue;
        }
        let r = rep_of(*id);
        if let Some(slot) = allocation.slot_of.get(&r).copied() {
            allocation.slot_of.insert(*id, slot);
            continue;
        }
        let slot = match last_use_in_bb.get(id) {
            Some(Some(_)) => free.pop().unwrap_or_else(|| {
                let s = next;
                next += 1;
                s
            }),
            _ => {
                let s = next;
                next += 1;
                s
            }
        };
        if next == u16::MAX {
            return Err(LowerError::TooManySlots);
        }
        allocation.slot_of.insert(r, slot);
        if r != *id {
            allocation.slot_of.insert(*id, slot);
        }
        if let Some(Some(last)) = last_use_in_bb.get(id) {
            releases.push((*last, slot));
        }
    }

    allocation.num_slots = next;
    allocation.on_stack = on_stack;
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_bytecode::PoolIdx;

    #[test]
    fn test_phi_group_shares_slot() {
        let mut code = Code::new();
        let t = code.new_bb();
        let f = code.new_bb();
        let join = code.new_bb();
        let head = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(head);
        let c = code.push(head, Tag::LdArg { index: 0 }, vec![]);
        code.instr_mut(c).ty = crate::ir::ty::PirType::test();
        code.push(head, Tag::Branch, vec![Value::Instr(c)]);
        code.bb_mut(head).next0 = Some(t);
        code.bb_mut(head).next1 = Some(f);
        let ct = code.push(t, Tag::PirCopy, vec![Value::True]);
        code.bb_mut(t).next0 = Some(join);
        let cf = code.push(f, Tag::PirCopy, vec![Value::False]);
        code.bb_mut(f).next0 = Some(join);
        let phi = code.push(
            join,
            Tag::Phi { inputs: vec![t, f] },
            vec![Value::Instr(ct), Value::Instr(cf)],
        );
        code.move_instr(phi, join, 0);
        code.push(join, Tag::Return, vec![Value::Instr(phi)]);

        let allocation = allocate(&code).unwrap();
        let ps = allocation.slot(phi).unwrap();
        assert_eq!(allocation.slot(ct), Some(ps));
        assert_eq!(allocation.slot(cf), Some(ps));
    }

    #[test]
    fn test_stack_mode_for_adjacent_single_use() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let c = code.push(bb, Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        code.push(bb, Tag::Return, vec![Value::Instr(c)]);

        let allocation = allocate(&code).unwrap();
        assert!(allocation.on_stack.contains(&c));
        assert_eq!(allocation.slot(c), None);
    }

    #[test]
    fn test_block_local_slot_reuse() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        // a used early, then b; their ranges do not overlap
        let a = code.push(bb, Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        let a2 = code.push(bb, Tag::Length, vec![Value::Instr(a)]);
        let nop = code.push(bb, Tag::Nop, vec![]);
        let b = code.push(bb, Tag::LdConst { idx: PoolIdx(1) }, vec![]);
        let b2 = code.push(bb, Tag::Length, vec![Value::Instr(b)]);
        let sum = code.push(bb, Tag::Add, vec![Value::Instr(a2), Value::Instr(b2), Value::ElidedEnv]);
        code.push(bb, Tag::Return, vec![Value::Instr(sum)]);
        let _ = nop;

        let allocation = allocate(&code).unwrap();
        // The two constants reuse storage once released (a is consumed
        // before b is defined); farther-apart values may share
        if let (Some(sa), Some(sb)) = (allocation.slot(a), allocation.slot(b)) {
            assert_eq!(sa, sb);
        }
    }
}
