//! Generic forward fixed-point engine.
//!
//! Per block we keep a list of abstract states: the entry state, then one
//! additional state after each call-like instruction. Analyses can thereby
//! re-enter a known state at any call boundary, which matters because call
//! returns interact with scope facts. Queries at arbitrary positions replay
//! `apply` from the nearest stored state; between calls replay is cheap.
//!
//! Block exits via `Deopt` are not merged into the function-exit join: the
//! deopt branch resumes in the interpreter, not at the function's return.

use rustc_hash::FxHashMap;

use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::InstrId;
use crate::visitor::Visitor;

/// Outcome of merging one abstract state into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AbstractRes {
    None,
    Updated,
    LostPrecision,
    Tainted,
}

impl AbstractRes {
    pub fn max(self, other: AbstractRes) -> AbstractRes {
        std::cmp::max(self, other)
    }

    pub fn changed(self) -> bool {
        self != AbstractRes::None
    }
}

/// An abstract-state lattice element.
pub trait AbstractState: Clone {
    fn merge(&mut self, other: &Self) -> AbstractRes;
}

/// A concrete forward analysis.
pub trait Analysis {
    type State: AbstractState;

    fn init(&self, code: &Code) -> Self::State;

    /// Transfer function for one instruction.
    fn apply(&self, state: &mut Self::State, code: &Code, id: InstrId);

    /// Whether an extra state segment is stored after this instruction.
    fn segment_after(&self, code: &Code, id: InstrId) -> bool {
        code.instr(id).tag.is_call()
    }
}

/// Fixed-point results: per-block state lists plus the exit join.
pub struct FixedPoint<A: Analysis> {
    pub analysis: A,
    mergepoints: FxHashMap<BBId, Vec<A::State>>,
    exit: Option<A::State>,
}

impl<A: Analysis> FixedPoint<A> {
    /// Run the analysis to a fixed point over `code`.
    pub fn run(analysis: A, code: &Code) -> FixedPoint<A> {
        let mut fp = FixedPoint { analysis, mergepoints: FxHashMap::default(), exit: None };
        fp.mergepoints.insert(code.entry, vec![fp.analysis.init(code)]);

        let mut changed: FxHashMap<BBId, bool> = FxHashMap::default();
        changed.insert(code.entry, true);

        loop {
            let mut done = true;
            let mut exit_states: Vec<A::State> = Vec::new();
            Visitor::run(code, |bb| {
                if !changed.get(&bb).copied().unwrap_or(false) {
                    return;
                }
                changed.insert(bb, false);
                let Some(states) = self_entry(&fp.mergepoints, bb) else { return };
                let mut state = states.clone();

                let mut segment = 0;
                let instrs: Vec<InstrId> = code.bb(bb).instrs.clone();
                for id in &instrs {
                    fp.analysis.apply(&mut state, code, *id);
                    if fp.analysis.segment_after(code, *id) {
                        segment += 1;
                        let list = fp.mergepoints.get_mut(&bb).unwrap();
                        if list.len() <= segment {
                            list.resize_with(segment + 1, || state.clone());
                        }
                        list[segment] = state.clone();
                    }
                }

                let block = code.bb(bb);
                if block.is_exit() {
                    let deopts = block
                        .last()
                        .map(|l| matches!(code.instr(l).tag, Tag::Deopt | Tag::ScheduledDeopt { .. }))
                        .unwrap_or(false);
                    if !deopts {
                        exit_states.push(state.clone());
                    }
                    return;
                }

                for succ in block.successors() {
                    match fp.mergepoints.get_mut(&succ) {
                        None => {
                            fp.mergepoints.insert(succ, vec![state.clone()]);
                            changed.insert(succ, true);
                            done = false;
                        }
                        Some(list) => {
                            if list[0].merge(&state).changed() {
                                changed.insert(succ, true);
                                done = false;
                            }
                        }
                    }
                }
            });

            for s in exit_states {
                match &mut fp.exit {
                    None => fp.exit = Some(s),
                    Some(e) => {
                        e.merge(&s);
                    }
                }
            }

            if done {
                break;
            }
        }
        fp
    }

    /// The state at function exit (join over all non-deopt exits).
    pub fn exit(&self) -> Option<&A::State> {
        self.exit.as_ref()
    }

    /// The state immediately before an instruction.
    pub fn before(&self, code: &Code, id: InstrId) -> A::State {
        self.seek(code, id, false)
    }

    /// The state immediately after an instruction.
    pub fn after(&self, code: &Code, id: InstrId) -> A::State {
        self.seek(code, id, true)
    }

    fn seek(&self, code: &Code, target: InstrId, after: bool) -> A::State {
        let bb = code.instr(target).bb;
        let states = &self.mergepoints[&bb];
        let mut state = states[0].clone();
        let mut segment = 0;
        for id in &code.bb(bb).instrs {
            if !after && *id == target {
                return state;
            }
            if self.analysis.segment_after(code, *id) {
                segment += 1;
                state = states
                    .get(segment)
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut s = state.clone();
                        self.analysis.apply(&mut s, code, *id);
                        s
                    });
            } else {
                self.analysis.apply(&mut state, code, *id);
            }
            if after && *id == target {
                return state;
            }
        }
        state
    }

    /// Walk every instruction with the state before it.
    pub fn foreach_before(&self, code: &Code, mut f: impl FnMut(&A::State, InstrId)) {
        Visitor::run(code, |bb| {
            let Some(states) = self.mergepoints.get(&bb) else { return };
            let mut state = states[0].clone();
            let mut segment = 0;
            for id in &code.bb(bb).instrs {
                f(&state, *id);
                if self.analysis.segment_after(code, *id) {
                    segment += 1;
                    if let Some(s) = states.get(segment) {
                        state = s.clone();
                    } else {
                        self.analysis.apply(&mut state, code, *id);
                    }
                } else {
                    self.analysis.apply(&mut state, code, *id);
                }
            }
        });
    }
}

fn self_entry<'a, S: Clone>(
    mergepoints: &'a FxHashMap<BBId, Vec<S>>,
    bb: BBId,
) -> Option<&'a S> {
    mergepoints.get(&bb).and_then(|v| v.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tag::Tag;
    use crate::ir::value::Value;

    /// Counts LdArg instructions seen along each path; merges by max.
    struct CountArgs;

    #[derive(Clone, PartialEq, Debug)]
    struct Count(u32);

    impl AbstractState for Count {
        fn merge(&mut self, other: &Self) -> AbstractRes {
            if other.0 > self.0 {
                self.0 = other.0;
                AbstractRes::Updated
            } else {
                AbstractRes::None
            }
        }
    }

    impl Analysis for CountArgs {
        type State = Count;
        fn init(&self, _code: &Code) -> Count {
            Count(0)
        }
        fn apply(&self, state: &mut Count, code: &Code, id: InstrId) {
            if matches!(code.instr(id).tag, Tag::LdArg { .. }) {
                state.0 += 1;
            }
        }
    }

    #[test]
    fn test_straight_line_exit() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let a = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        code.push(bb, Tag::LdArg { index: 1 }, vec![]);
        code.push(bb, Tag::Return, vec![Value::Instr(a)]);

        let fp = FixedPoint::run(CountArgs, &code);
        assert_eq!(fp.exit(), Some(&Count(2)));
        assert_eq!(fp.before(&code, a), Count(0));
        assert_eq!(fp.after(&code, a), Count(1));
    }

    #[test]
    fn test_merge_takes_max() {
        // branch: one arm loads an extra arg
        let mut code = Code::new();
        let a = code.new_bb();
        let b = code.new_bb();
        let c = code.new_bb();
        let m = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        code.push(a, Tag::Branch, vec![Value::True]);
        code.bb_mut(a).next0 = Some(b);
        code.bb_mut(a).next1 = Some(c);
        code.push(b, Tag::LdArg { index: 0 }, vec![]);
        code.bb_mut(b).next0 = Some(m);
        code.bb_mut(c).next0 = Some(m);
        code.push(m, Tag::Return, vec![Value::Nil]);

        let fp = FixedPoint::run(CountArgs, &code);
        assert_eq!(fp.exit(), Some(&Count(1)));
    }

    #[test]
    fn test_deopt_exit_excluded() {
        let mut code = Code::new();
        let a = code.new_bb();
        let ok = code.new_bb();
        let deopt = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        code.push(a, Tag::Checkpoint, vec![]);
        code.bb_mut(a).next0 = Some(ok);
        code.bb_mut(a).next1 = Some(deopt);
        // The deopt path sees two extra args; it must not pollute the exit
        code.push(deopt, Tag::LdArg { index: 0 }, vec![]);
        code.push(deopt, Tag::LdArg { index: 1 }, vec![]);
        let fs = code.push(
            deopt,
            Tag::FrameState {
                code: tarn_bytecode::CodeRef {
                    fun: tarn_bytecode::FunId(0),
                    which: tarn_bytecode::WhichCode::Body,
                },
                pc: 0,
                stack_len: 0,
                in_promise: false,
                has_parent: false,
            },
            vec![Value::BaseEnv],
        );
        code.push(deopt, Tag::Deopt, vec![Value::Instr(fs)]);
        code.push(ok, Tag::Return, vec![Value::Nil]);

        let fp = FixedPoint::run(CountArgs, &code);
        assert_eq!(fp.exit(), Some(&Count(0)));
    }
}
