//! Integer range analysis.
//!
//! An interval lattice over scalar integer values, exact only inside a small
//! window and saturating outside it, which bounds the lattice height and
//! guarantees termination without widening heuristics. Branch edges refine
//! intervals after comparisons against a known bound. The overflow pass uses
//! the result to prove arithmetic cannot leave the integer range.

use rustc_hash::FxHashMap;

use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};

/// Exact bounds are only kept within ±WINDOW; beyond, the side saturates.
const WINDOW: i64 = 20;

/// A saturating integer interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub lo: i64,
    pub hi: i64,
}

impl Interval {
    pub const TOP: Interval = Interval { lo: i64::MIN, hi: i64::MAX };

    pub fn exact(v: i64) -> Interval {
        Interval { lo: v, hi: v }.saturate()
    }

    fn saturate(self) -> Interval {
        let lo = if self.lo < -WINDOW { i64::MIN } else { self.lo };
        let hi = if self.hi > WINDOW { i64::MAX } else { self.hi };
        Interval { lo, hi }
    }

    pub fn union(self, other: Interval) -> Interval {
        Interval { lo: self.lo.min(other.lo), hi: self.hi.max(other.hi) }.saturate()
    }

    pub fn intersect(self, other: Interval) -> Interval {
        Interval { lo: self.lo.max(other.lo), hi: self.hi.min(other.hi) }
    }

    pub fn is_finite(&self) -> bool {
        self.lo != i64::MIN && self.hi != i64::MAX
    }

    fn add(self, other: Interval) -> Interval {
        if !self.is_finite() || !other.is_finite() {
            return Interval::TOP;
        }
        Interval { lo: self.lo + other.lo, hi: self.hi + other.hi }.saturate()
    }

    fn sub(self, other: Interval) -> Interval {
        if !self.is_finite() || !other.is_finite() {
            return Interval::TOP;
        }
        Interval { lo: self.lo - other.hi, hi: self.hi - other.lo }.saturate()
    }

    fn mul(self, other: Interval) -> Interval {
        if !self.is_finite() || !other.is_finite() {
            return Interval::TOP;
        }
        let products = [
            self.lo * other.lo,
            self.lo * other.hi,
            self.hi * other.lo,
            self.hi * other.hi,
        ];
        Interval {
            lo: *products.iter().min().unwrap(),
            hi: *products.iter().max().unwrap(),
        }
        .saturate()
    }
}

type RangeState = FxHashMap<InstrId, Interval>;

/// Per-block entry intervals after a fixed point, with point queries.
pub struct RangeAnalysis {
    entry_states: FxHashMap<BBId, RangeState>,
}

impl RangeAnalysis {
    pub fn compute(code: &Code, consts: &dyn Fn(InstrId) -> Option<i64>) -> RangeAnalysis {
        let mut entry_states: FxHashMap<BBId, RangeState> = FxHashMap::default();
        entry_states.insert(code.entry, RangeState::default());

        let mut work = vec![code.entry];
        while let Some(bb) = work.pop() {
            let Some(mut state) = entry_states.get(&bb).cloned() else { continue };
            for id in &code.bb(bb).instrs {
                apply(&mut state, code, *id, consts);
            }

            let block = code.bb(bb);
            let succs: Vec<BBId> = block.successors().collect();
            for succ in &succs {
                let mut out = state.clone();
                refine_edge(&mut out, code, bb, *succ);
                let changed = match entry_states.get_mut(succ) {
                    None => {
                        entry_states.insert(*succ, out);
                        true
                    }
                    Some(existing) => merge_into(existing, &out),
                };
                if changed {
                    work.push(*succ);
                }
            }
        }

        RangeAnalysis { entry_states }
    }

    /// The interval of a value just before `at`.
    pub fn interval_before(
        &self,
        code: &Code,
        at: InstrId,
        of: InstrId,
        consts: &dyn Fn(InstrId) -> Option<i64>,
    ) -> Interval {
        let bb = code.instr(at).bb;
        let Some(entry) = self.entry_states.get(&bb) else { return Interval::TOP };
        let mut state = entry.clone();
        for id in &code.bb(bb).instrs {
            if *id == at {
                break;
            }
            apply(&mut state, code, *id, consts);
        }
        state.get(&of).copied().unwrap_or(Interval::TOP)
    }
}

fn merge_into(dst: &mut RangeState, src: &RangeState) -> bool {
    let mut changed = false;
    // Keys in dst but not src widen to top
    let only_dst: Vec<InstrId> = dst.keys().filter(|k| !src.contains_key(k)).copied().collect();
    for k in only_dst {
        if dst.remove(&k).is_some() {
            changed = true;
        }
    }
    for (k, v) in src {
        if let Some(mine) = dst.get_mut(k) {
            let joined = mine.union(*v);
            if joined != *mine {
                *mine = joined;
                changed = true;
            }
        }
    }
    changed
}

fn apply(state: &mut RangeState, code: &Code, id: InstrId, consts: &dyn Fn(InstrId) -> Option<i64>) {
    let instr = code.instr(id);
    let of = |state: &RangeState, v: &Value| -> Interval {
        match v {
            Value::Instr(i) => state
                .get(i)
                .copied()
                .or_else(|| consts(*i).map(Interval::exact))
                .unwrap_or(Interval::TOP),
            _ => Interval::TOP,
        }
    };
    let result = match &instr.tag {
        Tag::LdConst { .. } => consts(id).map(Interval::exact),
        Tag::Add => Some(of(state, &instr.args[0]).add(of(state, &instr.args[1]))),
        Tag::Sub => Some(of(state, &instr.args[0]).sub(of(state, &instr.args[1]))),
        Tag::Mul => Some(of(state, &instr.args[0]).mul(of(state, &instr.args[1]))),
        Tag::Phi { .. } => {
            let mut acc: Option<Interval> = None;
            for a in &instr.args {
                let i = of(state, a);
                acc = Some(match acc {
                    None => i,
                    Some(prev) => prev.union(i),
                });
            }
            acc
        }
        Tag::ForSeqSize | Tag::Length => Some(Interval { lo: 0, hi: i64::MAX }),
        Tag::PirCopy | Tag::Force { .. } | Tag::CastType { .. } => Some(of(state, &instr.args[0])),
        _ => None,
    };
    if let Some(interval) = result {
        state.insert(id, interval);
    }
}

/// Refine intervals along a branch edge guarded by a comparison.
fn refine_edge(state: &mut RangeState, code: &Code, from: BBId, to: BBId) {
    let block = code.bb(from);
    let Some(last) = block.last() else { return };
    if !matches!(code.instr(last).tag, Tag::Branch) {
        return;
    }
    let Some(Value::Instr(cond)) = code.instr(last).args.first().copied() else { return };
    let cmp = code.instr(cond);
    let (lhs, rhs) = match cmp.tag {
        Tag::Lt | Tag::Lte | Tag::Gt | Tag::Gte => (cmp.args[0], cmp.args[1]),
        _ => return,
    };
    let (Value::Instr(l), Value::Instr(r)) = (lhs, rhs) else { return };
    let taken = block.next0 == Some(to);
    let li = state.get(&l).copied().unwrap_or(Interval::TOP);
    let ri = state.get(&r).copied().unwrap_or(Interval::TOP);

    // On the true edge of l < r: l <= r.hi - 1, r >= l.lo + 1; dual on false
    let (l_new, r_new) = match (&cmp.tag, taken) {
        (Tag::Lt, true) | (Tag::Gte, false) => (
            li.intersect(Interval { lo: i64::MIN, hi: ri.hi.saturating_sub(1) }),
            ri.intersect(Interval { lo: li.lo.saturating_add(1), hi: i64::MAX }),
        ),
        (Tag::Lte, true) | (Tag::Gt, false) => (
            li.intersect(Interval { lo: i64::MIN, hi: ri.hi }),
            ri.intersect(Interval { lo: li.lo, hi: i64::MAX }),
        ),
        (Tag::Gt, true) | (Tag::Lte, false) => (
            li.intersect(Interval { lo: ri.lo.saturating_add(1), hi: i64::MAX }),
            ri.intersect(Interval { lo: i64::MIN, hi: li.hi.saturating_sub(1) }),
        ),
        (Tag::Gte, true) | (Tag::Lt, false) => (
            li.intersect(Interval { lo: ri.lo, hi: i64::MAX }),
            ri.intersect(Interval { lo: i64::MIN, hi: li.hi }),
        ),
        _ => return,
    };
    state.insert(l, l_new);
    state.insert(r, r_new);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_saturation() {
        assert_eq!(Interval::exact(5), Interval { lo: 5, hi: 5 });
        assert_eq!(Interval::exact(100).hi, i64::MAX);
        assert_eq!(Interval::exact(-100).lo, i64::MIN);
        let a = Interval::exact(10).add(Interval::exact(10));
        // 20 is inside the window
        assert_eq!(a, Interval { lo: 20, hi: 20 });
        let b = Interval::exact(15).add(Interval::exact(15));
        assert_eq!(b.hi, i64::MAX);
    }

    #[test]
    fn test_straight_line_arith() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let a = code.push(bb, Tag::LdConst { idx: tarn_bytecode::PoolIdx(0) }, vec![]);
        let b = code.push(bb, Tag::LdConst { idx: tarn_bytecode::PoolIdx(1) }, vec![]);
        let sum = code.push(bb, Tag::Add, vec![Value::Instr(a), Value::Instr(b), Value::ElidedEnv]);
        let ret = code.push(bb, Tag::Return, vec![Value::Instr(sum)]);

        let consts = move |id: InstrId| -> Option<i64> {
            if id == a {
                Some(3)
            } else if id == b {
                Some(4)
            } else {
                None
            }
        };
        let ranges = RangeAnalysis::compute(&code, &consts);
        let i = ranges.interval_before(&code, ret, sum, &consts);
        assert_eq!(i, Interval { lo: 7, hi: 7 });
    }

    #[test]
    fn test_branch_refinement() {
        // if (x < 5) use(x)
        let mut code = Code::new();
        let head = code.new_bb();
        let then_bb = code.new_bb();
        let else_bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(head);
        let x = code.push(head, Tag::LdArg { index: 0 }, vec![]);
        let five = code.push(head, Tag::LdConst { idx: tarn_bytecode::PoolIdx(0) }, vec![]);
        let cmp = code.push(head, Tag::Lt, vec![Value::Instr(x), Value::Instr(five), Value::ElidedEnv]);
        code.push(head, Tag::Branch, vec![Value::Instr(cmp)]);
        code.bb_mut(head).next0 = Some(then_bb);
        code.bb_mut(head).next1 = Some(else_bb);
        let use_then = code.push(then_bb, Tag::Return, vec![Value::Instr(x)]);
        let use_else = code.push(else_bb, Tag::Return, vec![Value::Instr(x)]);

        let consts = move |id: InstrId| if id == five { Some(5) } else { None };
        let ranges = RangeAnalysis::compute(&code, &consts);
        let then_range = ranges.interval_before(&code, use_then, x, &consts);
        assert_eq!(then_range.hi, 4);
        let else_range = ranges.interval_before(&code, use_else, x, &consts);
        assert_eq!(else_range.lo, 5);
    }
}
