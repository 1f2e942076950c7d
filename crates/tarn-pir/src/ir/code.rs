//! Code units: the instruction arena and block graph.
//!
//! A `Code` owns its blocks and instructions. Instructions are arena-slots
//! addressed by `InstrId`; deletion marks the slot and detaches it from its
//! block, and `gc` severs the deleted slots' outgoing edges in bulk. Ids are
//! never reused within a `Code`, so a stale id is detectable.

use rustc_hash::FxHashMap;

use super::bb::{BBId, BB};
use super::instr::{self, Instr};
use super::tag::Tag;
use super::ty::PirType;
use super::value::{InstrId, Value};
use crate::ir::effects::Effects;

/// Result of cloning another code unit's graph into this one.
#[derive(Debug)]
pub struct CloneMap {
    pub entry: BBId,
    pub instrs: FxHashMap<InstrId, InstrId>,
    pub bbs: FxHashMap<BBId, BBId>,
}

/// A code unit: entry block plus arenas.
#[derive(Debug, Clone, Default)]
pub struct Code {
    instrs: Vec<Instr>,
    bbs: Vec<BB>,
    pub entry: BBId,
}

impl Code {
    /// An empty code unit with a single entry block.
    pub fn new() -> Code {
        let mut code = Code { instrs: Vec::new(), bbs: Vec::new(), entry: BBId(0) };
        code.entry = code.new_bb();
        code
    }

    // ===== Accessors =====

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.0 as usize]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.0 as usize]
    }

    pub fn bb(&self, id: BBId) -> &BB {
        &self.bbs[id.0 as usize]
    }

    pub fn bb_mut(&mut self, id: BBId) -> &mut BB {
        &mut self.bbs[id.0 as usize]
    }

    pub fn num_bbs(&self) -> usize {
        self.bbs.len()
    }

    pub fn num_instr_slots(&self) -> usize {
        self.instrs.len()
    }

    /// Ids of all live blocks, in id order.
    pub fn bb_ids(&self) -> Vec<BBId> {
        (0..self.bbs.len() as u32).map(BBId).filter(|id| !self.bb(*id).deleted).collect()
    }

    /// Number of live instructions.
    pub fn instr_count(&self) -> usize {
        self.bb_ids().iter().map(|b| self.bb(*b).instrs.len()).sum()
    }

    pub fn value_ty(&self, v: &Value) -> PirType {
        v.ty(self)
    }

    // ===== Construction =====

    pub fn new_bb(&mut self) -> BBId {
        let id = BBId(self.bbs.len() as u32);
        self.bbs.push(BB::default());
        id
    }

    fn alloc_instr(&mut self, tag: Tag, args: Vec<Value>, bb: BBId) -> InstrId {
        let ty = {
            let this = &*self;
            instr::initial_type(&tag, &args, |v| v.ty(this))
        };
        let mut i = Instr::new(tag, args, bb);
        i.ty = ty;
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(i);
        id
    }

    /// Append an instruction to a block.
    pub fn push(&mut self, bb: BBId, tag: Tag, args: Vec<Value>) -> InstrId {
        let id = self.alloc_instr(tag, args, bb);
        self.bb_mut(bb).instrs.push(id);
        id
    }

    /// Insert an instruction at a position within a block.
    pub fn insert_at(&mut self, bb: BBId, pos: usize, tag: Tag, args: Vec<Value>) -> InstrId {
        let id = self.alloc_instr(tag, args, bb);
        self.bb_mut(bb).instrs.insert(pos, id);
        id
    }

    /// Move an existing instruction to a new position (same or other block).
    pub fn move_instr(&mut self, id: InstrId, to_bb: BBId, pos: usize) {
        let from_bb = self.instr(id).bb;
        self.bb_mut(from_bb).instrs.retain(|i| *i != id);
        let pos = pos.min(self.bb(to_bb).instrs.len());
        self.bb_mut(to_bb).instrs.insert(pos, id);
        self.instr_mut(id).bb = to_bb;
    }

    // ===== Deletion =====

    /// Stage an instruction for reclamation and detach it from its block.
    pub fn remove_instr(&mut self, id: InstrId) {
        let bb = self.instr(id).bb;
        self.bb_mut(bb).instrs.retain(|i| *i != id);
        self.instr_mut(id).deleted = true;
    }

    /// Remove the instruction at a block position; returns it.
    pub fn remove_at(&mut self, bb: BBId, pos: usize) -> InstrId {
        let id = self.bb_mut(bb).instrs.remove(pos);
        self.instr_mut(id).deleted = true;
        id
    }

    /// Replace the instruction at a block position with a new one.
    pub fn replace_at(&mut self, bb: BBId, pos: usize, tag: Tag, args: Vec<Value>) -> InstrId {
        let old = self.bb(bb).instrs[pos];
        let new = self.alloc_instr(tag, args, bb);
        self.bb_mut(bb).instrs[pos] = new;
        let i = self.instr_mut(old);
        i.deleted = true;
        new
    }

    /// Sever deleted instructions' outgoing edges. Run between passes, never
    /// while a visitor is iterating.
    pub fn gc(&mut self) {
        for i in self.instrs.iter_mut() {
            if i.deleted {
                i.args.clear();
            }
        }
    }

    // ===== Use rewriting =====

    /// Replace every use of `old` in this code unit with `new`.
    pub fn replace_uses_with(&mut self, old: InstrId, new: Value) {
        for i in self.instrs.iter_mut() {
            if i.deleted {
                continue;
            }
            for arg in i.args.iter_mut() {
                if *arg == Value::Instr(old) {
                    *arg = new;
                }
            }
        }
    }

    /// Whether an instruction has any remaining use.
    pub fn has_uses(&self, id: InstrId) -> bool {
        self.instrs
            .iter()
            .any(|i| !i.deleted && i.args.contains(&Value::Instr(id)))
    }

    /// All live instructions using `id`.
    pub fn uses_of(&self, id: InstrId) -> Vec<InstrId> {
        (0..self.instrs.len() as u32)
            .map(InstrId)
            .filter(|u| {
                let i = self.instr(*u);
                !i.deleted && i.args.contains(&Value::Instr(id))
            })
            .collect()
    }

    // ===== Type and effect refinement =====

    /// Recompute an instruction's type and effects from its operands.
    /// Returns whether anything changed.
    pub fn update_type_and_effects(&mut self, id: InstrId) -> bool {
        let i = self.instr(id);
        let tag = i.tag.clone();
        let args = i.args.clone();
        let old_ty = i.ty;
        let old_eff = i.effects;
        let mut ty = old_ty;
        let mut eff = old_eff;

        match &tag {
            Tag::Phi { .. } => {
                ty = args.iter().fold(PirType::bottom(), |acc, v| acc.union(&v.ty(self)));
            }
            Tag::PirCopy | Tag::ChkMissing => {
                ty = args[0].ty(self);
                if matches!(tag, Tag::ChkMissing) {
                    ty = ty.not_missing();
                    if !args[0].ty(self).maybe_missing() {
                        eff = Effects::empty();
                    }
                }
            }
            Tag::Force { .. } => {
                let input = args[0];
                ty = input.ty(self).forced();
                // Forcing an argument whose eager value is known yields that
                // value's type and cannot run user code
                if let Value::Instr(a) = input.followed(self) {
                    if let Tag::MkArg { .. } = self.instr(a).tag {
                        let eager = self.instr(a).args[0];
                        if eager != Value::Missing {
                            ty = eager.ty(self).forced();
                            eff = Effects::empty();
                        }
                    }
                }
                if !input.ty(self).maybe_promise_wrapped() {
                    eff = Effects::empty();
                }
            }
            t if t.is_binop() || t.is_unop() => {
                let operands: Vec<PirType> = args[..args.len() - 1].iter().map(|v| v.ty(self)).collect();
                let maybe_obj = operands.iter().any(|t| t.maybe_obj());
                if !maybe_obj {
                    // No dispatch: the environment is unused and no user code
                    // can run
                    eff -= Effects::READS_ENV
                        | Effects::WRITES_ENV
                        | Effects::LEAKS_ENV
                        | Effects::EXECUTES_CODE
                        | Effects::REFLECTION;
                    let num = PirType::num();
                    if matches!(
                        tag,
                        Tag::Add | Tag::Sub | Tag::Mul | Tag::Div | Tag::IDiv | Tag::Mod
                            | Tag::Pow | Tag::Plus | Tag::Minus
                    ) && operands.iter().all(|t| t.forced().is_a(&num))
                    {
                        let mut joined =
                            operands.iter().fold(PirType::bottom(), |acc, t| acc.union(&t.forced()));
                        if operands.iter().all(|t| t.is_scalar()) {
                            joined = joined.scalar();
                        }
                        // Integer arithmetic may overflow into real
                        if matches!(tag, Tag::Add | Tag::Sub | Tag::Mul | Tag::Pow | Tag::Div) {
                            joined = joined.union(&PirType::real().scalar());
                            if !operands.iter().all(|t| t.is_scalar()) {
                                joined = joined.or_not_scalar();
                            }
                        }
                        ty = joined.not_object();
                        eff -= Effects::ERROR | Effects::WARN;
                    }
                    if tag.is_comparison() && operands.iter().all(|t| t.forced().is_a(&num)) {
                        let mut t = PirType::r(super::ty::RTypeSet::LGL).not_object();
                        if operands.iter().all(|t| t.is_scalar()) {
                            t = t.scalar();
                        }
                        if !operands.iter().any(|t| t.maybe_na()) {
                            t = t.not_na();
                        }
                        ty = t;
                        eff -= Effects::ERROR | Effects::WARN;
                    }
                }
            }
            _ => {}
        }

        let i = self.instr_mut(id);
        let changed = i.ty != ty || i.effects != eff;
        i.ty = ty;
        i.effects = eff;
        changed
    }

    // ===== Block transforms =====

    /// Split a block at an instruction position. The tail (including the
    /// instruction at `pos`) moves to a fresh block that inherits the
    /// successors; the original jumps to it. Phi inputs in the old
    /// successors are re-labeled.
    pub fn split(&mut self, bb: BBId, pos: usize) -> BBId {
        let new = self.new_bb();
        let tail: Vec<InstrId> = self.bb_mut(bb).instrs.split_off(pos);
        for id in &tail {
            self.instr_mut(*id).bb = new;
        }
        let (n0, n1) = (self.bb(bb).next0, self.bb(bb).next1);
        {
            let nb = self.bb_mut(new);
            nb.instrs = tail;
            nb.next0 = n0;
            nb.next1 = n1;
        }
        {
            let ob = self.bb_mut(bb);
            ob.next0 = Some(new);
            ob.next1 = None;
        }
        for succ in [n0, n1].into_iter().flatten() {
            self.relabel_phi_inputs(succ, bb, new);
        }
        new
    }

    /// Re-label phi inputs in `bb` that named `from` as their source block.
    pub fn relabel_phi_inputs(&mut self, bb: BBId, from: BBId, to: BBId) {
        let ids: Vec<InstrId> = self.bb(bb).instrs.clone();
        for id in ids {
            if let Tag::Phi { inputs } = &mut self.instr_mut(id).tag {
                for input in inputs.iter_mut() {
                    if *input == from {
                        *input = to;
                    }
                }
            }
        }
    }

    /// Drop a phi input coming from a given predecessor, in all phis of `bb`.
    pub fn drop_phi_input(&mut self, bb: BBId, pred: BBId) {
        let ids: Vec<InstrId> = self.bb(bb).instrs.clone();
        for id in ids {
            let i = self.instr_mut(id);
            if let Tag::Phi { inputs } = &mut i.tag {
                if let Some(pos) = inputs.iter().position(|b| *b == pred) {
                    inputs.remove(pos);
                    i.args.remove(pos);
                }
            }
        }
    }

    /// Clone another code unit's reachable graph into this one, remapping all
    /// ids. Singleton values pass through unchanged.
    pub fn clone_from(&mut self, src: &Code) -> CloneMap {
        let mut bbs: FxHashMap<BBId, BBId> = FxHashMap::default();
        let mut instrs: FxHashMap<InstrId, InstrId> = FxHashMap::default();

        // Allocate blocks first so successor edges can be remapped
        let reachable = src.reachable_from(src.entry);
        for bb in &reachable {
            bbs.insert(*bb, self.new_bb());
        }
        // Allocate instruction slots
        for bb in &reachable {
            for id in &src.bb(*bb).instrs {
                let mut cloned = src.instr(*id).clone();
                cloned.bb = bbs[bb];
                let new_id = InstrId(self.instrs.len() as u32);
                self.instrs.push(cloned);
                instrs.insert(*id, new_id);
            }
        }
        // Rewire
        for bb in &reachable {
            let new_bb = bbs[bb];
            let ids: Vec<InstrId> = src.bb(*bb).instrs.iter().map(|i| instrs[i]).collect();
            self.bb_mut(new_bb).instrs = ids.clone();
            self.bb_mut(new_bb).next0 = src.bb(*bb).next0.map(|b| bbs[&b]);
            self.bb_mut(new_bb).next1 = src.bb(*bb).next1.map(|b| bbs[&b]);
            for id in ids {
                let i = self.instr_mut(id);
                for arg in i.args.iter_mut() {
                    if let Value::Instr(a) = arg {
                        if let Some(n) = instrs.get(a) {
                            *arg = Value::Instr(*n);
                        }
                    }
                }
                if let Tag::Phi { inputs } = &mut i.tag {
                    for input in inputs.iter_mut() {
                        if let Some(n) = bbs.get(input) {
                            *input = *n;
                        }
                    }
                }
            }
        }
        CloneMap { entry: bbs[&src.entry], instrs, bbs }
    }

    /// Blocks reachable from `start`, in discovery order.
    pub fn reachable_from(&self, start: BBId) -> Vec<BBId> {
        let mut seen = vec![false; self.bbs.len()];
        let mut order = Vec::new();
        let mut work = vec![start];
        while let Some(bb) = work.pop() {
            if seen[bb.0 as usize] || self.bb(bb).deleted {
                continue;
            }
            seen[bb.0 as usize] = true;
            order.push(bb);
            for succ in self.bb(bb).successors() {
                work.push(succ);
            }
        }
        order
    }

    /// Rewrite the `Return` exits of an inlined region into jumps to
    /// `target`, producing the region's result value. Multiple returns merge
    /// through a phi prepended to `target`.
    pub fn inline_returns(&mut self, region_entry: BBId, target: BBId) -> Value {
        let mut sites: Vec<(BBId, Value)> = Vec::new();
        for bb in self.reachable_from(region_entry) {
            if let Some(last) = self.bb(bb).last() {
                if matches!(self.instr(last).tag, Tag::Return) {
                    let val = self.instr(last).args[0];
                    let pos = self.bb(bb).instrs.len() - 1;
                    self.remove_at(bb, pos);
                    self.bb_mut(bb).next0 = Some(target);
                    sites.push((bb, val));
                }
            }
        }
        match sites.len() {
            0 => Value::Tombstone(super::value::Tombstone::Unreachable),
            1 => sites[0].1,
            _ => {
                let inputs: Vec<BBId> = sites.iter().map(|(b, _)| *b).collect();
                let args: Vec<Value> = sites.iter().map(|(_, v)| *v).collect();
                let phi = self.insert_at(target, 0, Tag::Phi { inputs }, args);
                self.update_type_and_effects(phi);
                Value::Instr(phi)
            }
        }
    }

    /// Compact block ids to a contiguous range, dropping deleted blocks.
    pub fn renumber_bbs(&mut self) {
        let live: Vec<BBId> = self.bb_ids();
        let mut map: FxHashMap<BBId, BBId> = FxHashMap::default();
        for (new, old) in live.iter().enumerate() {
            map.insert(*old, BBId(new as u32));
        }
        let mut new_bbs: Vec<BB> = Vec::with_capacity(live.len());
        for old in &live {
            let mut bb = std::mem::take(self.bb_mut(*old));
            bb.next0 = bb.next0.map(|b| map[&b]);
            bb.next1 = bb.next1.map(|b| map[&b]);
            new_bbs.push(bb);
        }
        self.bbs = new_bbs;
        self.entry = map[&self.entry];
        for i in self.instrs.iter_mut() {
            if i.deleted {
                continue;
            }
            if let Some(new) = map.get(&i.bb) {
                i.bb = *new;
            }
            if let Tag::Phi { inputs } = &mut i.tag {
                for input in inputs.iter_mut() {
                    if let Some(new) = map.get(input) {
                        *input = *new;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_code() -> Code {
        // entry: a = ldarg 0; b = force a; return b
        let mut code = Code::new();
        let entry = code.entry;
        let a = code.push(entry, Tag::LdArg { index: 0 }, vec![]);
        let b = code.push(entry, Tag::Force { has_fs: false }, vec![Value::Instr(a)]);
        code.push(entry, Tag::Return, vec![Value::Instr(b)]);
        code
    }

    #[test]
    fn test_push_and_types() {
        let code = simple_code();
        assert_eq!(code.instr_count(), 3);
        let force = code.bb(code.entry).instrs[1];
        assert!(!code.instr(force).ty.maybe_lazy());
    }

    #[test]
    fn test_replace_uses() {
        let mut code = simple_code();
        let entry = code.entry;
        let a = code.bb(entry).instrs[0];
        let force = code.bb(entry).instrs[1];
        // Pretend the force folded away
        code.replace_uses_with(force, Value::Instr(a));
        code.remove_instr(force);
        let ret = code.bb(entry).instrs[1];
        assert_eq!(code.instr(ret).args[0], Value::Instr(a));
        assert!(!code.has_uses(force));
    }

    #[test]
    fn test_split_moves_tail() {
        let mut code = simple_code();
        let entry = code.entry;
        let new = code.split(entry, 1);
        assert_eq!(code.bb(entry).instrs.len(), 1);
        assert_eq!(code.bb(new).instrs.len(), 2);
        assert_eq!(code.bb(entry).next0, Some(new));
        assert!(code.bb(new).is_exit());
        for id in &code.bb(new).instrs {
            assert_eq!(code.instr(*id).bb, new);
        }
    }

    #[test]
    fn test_clone_from_remaps() {
        let src = simple_code();
        let mut dst = Code::new();
        let map = dst.clone_from(&src);
        assert_ne!(map.entry, src.entry);
        let cloned_ret = *dst.bb(map.entry).instrs.last().unwrap();
        let arg = dst.instr(cloned_ret).args[0];
        // The cloned return references the cloned force, not the original id
        let cloned_force = map.instrs[&src.bb(src.entry).instrs[1]];
        assert_eq!(arg, Value::Instr(cloned_force));
    }

    #[test]
    fn test_inline_returns_single() {
        let mut code = Code::new();
        let region = code.new_bb();
        let c = code.push(region, Tag::LdArg { index: 0 }, vec![]);
        code.push(region, Tag::Return, vec![Value::Instr(c)]);
        let target = code.new_bb();
        let res = code.inline_returns(region, target);
        assert_eq!(res, Value::Instr(c));
        assert_eq!(code.bb(region).next0, Some(target));
        assert!(!code.bb(region).instrs.iter().any(|i| matches!(code.instr(*i).tag, Tag::Return)));
    }

    #[test]
    fn test_inline_returns_phi() {
        let mut code = Code::new();
        let r1 = code.new_bb();
        code.push(r1, Tag::Return, vec![Value::True]);
        let r2 = code.new_bb();
        code.push(r2, Tag::Return, vec![Value::False]);
        // Wire them into one region via a branch block
        let region = code.new_bb();
        code.push(region, Tag::Branch, vec![Value::True]);
        code.bb_mut(region).next0 = Some(r1);
        code.bb_mut(region).next1 = Some(r2);

        let target = code.new_bb();
        let res = code.inline_returns(region, target);
        let phi = res.as_instr().unwrap();
        assert!(matches!(code.instr(phi).tag, Tag::Phi { .. }));
        assert_eq!(code.instr(phi).args.len(), 2);
    }

    #[test]
    fn test_renumber_after_delete() {
        let mut code = simple_code();
        let dead = code.new_bb();
        code.bb_mut(dead).deleted = true;
        let tail = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(tail);
        code.renumber_bbs();
        assert_eq!(code.num_bbs(), 2);
        assert_eq!(code.entry, BBId(0));
        assert_eq!(code.bb(code.entry).next0, Some(BBId(1)));
    }
}
