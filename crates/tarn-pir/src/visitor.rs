//! Block visitors.
//!
//! Three iteration orders over a code unit's reachable blocks:
//! - `Visitor`: depth-first discovery order, cheapest; use when order does
//!   not matter
//! - `BreadthFirstVisitor`: queue order, deterministic for printing and for
//!   passes that must be stable across runs
//! - `DominatorTreeVisitor`: dominance preorder
//!
//! The `run_mut` variants tolerate the body inserting or removing blocks:
//! successor edges are re-read after every callback, and blocks created
//! during the walk are visited when reached.

use rustc_hash::FxHashSet;

use crate::cfg::DominanceGraph;
use crate::ir::bb::BBId;
use crate::ir::code::Code;

pub struct Visitor;

impl Visitor {
    /// Visit every reachable block once, depth-first.
    pub fn run(code: &Code, mut f: impl FnMut(BBId)) {
        let mut seen = FxHashSet::default();
        let mut work = vec![code.entry];
        while let Some(bb) = work.pop() {
            if !seen.insert(bb) {
                continue;
            }
            f(bb);
            for succ in code.bb(bb).successors() {
                work.push(succ);
            }
        }
    }

    /// As `run`, but the body may mutate the graph.
    pub fn run_mut(code: &mut Code, mut f: impl FnMut(&mut Code, BBId)) {
        let mut seen = FxHashSet::default();
        let mut work = vec![code.entry];
        while let Some(bb) = work.pop() {
            if code.bb(bb).deleted || !seen.insert(bb) {
                continue;
            }
            f(code, bb);
            if !code.bb(bb).deleted {
                for succ in code.bb(bb).successors() {
                    work.push(succ);
                }
            }
        }
    }

    /// Short-circuiting check; false from the body stops the walk.
    pub fn check(code: &Code, mut f: impl FnMut(BBId) -> bool) -> bool {
        let mut seen = FxHashSet::default();
        let mut work = vec![code.entry];
        while let Some(bb) = work.pop() {
            if !seen.insert(bb) {
                continue;
            }
            if !f(bb) {
                return false;
            }
            for succ in code.bb(bb).successors() {
                work.push(succ);
            }
        }
        true
    }
}

pub struct BreadthFirstVisitor;

impl BreadthFirstVisitor {
    /// Visit every reachable block once in queue order. Deterministic given
    /// the same graph.
    pub fn run(code: &Code, mut f: impl FnMut(BBId)) {
        let mut seen = FxHashSet::default();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(code.entry);
        seen.insert(code.entry);
        while let Some(bb) = queue.pop_front() {
            f(bb);
            for succ in code.bb(bb).successors() {
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
    }

    pub fn run_mut(code: &mut Code, mut f: impl FnMut(&mut Code, BBId)) {
        let mut seen = FxHashSet::default();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(code.entry);
        seen.insert(code.entry);
        while let Some(bb) = queue.pop_front() {
            if code.bb(bb).deleted {
                continue;
            }
            f(code, bb);
            if !code.bb(bb).deleted {
                for succ in code.bb(bb).successors() {
                    if seen.insert(succ) {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    /// The visit order as a vector.
    pub fn order(code: &Code) -> Vec<BBId> {
        let mut out = Vec::new();
        Self::run(code, |bb| out.push(bb));
        out
    }
}

pub struct DominatorTreeVisitor;

impl DominatorTreeVisitor {
    /// Visit blocks in dominance preorder: every definition site before any
    /// dominated use site.
    pub fn run(dom: &DominanceGraph, mut f: impl FnMut(BBId)) {
        for bb in dom.preorder() {
            f(bb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CFG;
    use crate::ir::tag::Tag;
    use crate::ir::value::Value;

    fn diamond() -> Code {
        let mut code = Code::new();
        let a = code.new_bb();
        let b = code.new_bb();
        let c = code.new_bb();
        let d = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(a);
        code.push(a, Tag::Branch, vec![Value::True]);
        code.bb_mut(a).next0 = Some(b);
        code.bb_mut(a).next1 = Some(c);
        code.bb_mut(b).next0 = Some(d);
        code.bb_mut(c).next0 = Some(d);
        code.push(d, Tag::Return, vec![Value::Nil]);
        code
    }

    #[test]
    fn test_visits_each_once() {
        let code = diamond();
        let mut count = 0;
        Visitor::run(&code, |_| count += 1);
        assert_eq!(count, 5);

        let mut count = 0;
        BreadthFirstVisitor::run(&code, |_| count += 1);
        assert_eq!(count, 5);
    }

    #[test]
    fn test_bfs_order_stable() {
        let code = diamond();
        let a = BreadthFirstVisitor::order(&code);
        let b = BreadthFirstVisitor::order(&code);
        assert_eq!(a, b);
        assert_eq!(a[0], code.entry);
    }

    #[test]
    fn test_check_short_circuits() {
        let code = diamond();
        let mut visited = 0;
        let ok = Visitor::check(&code, |_| {
            visited += 1;
            visited < 2
        });
        assert!(!ok);
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_run_mut_tolerates_insertion() {
        let mut code = diamond();
        let mut visited = 0;
        Visitor::run_mut(&mut code, |code, bb| {
            visited += 1;
            // Split jump blocks mid-walk
            if code.bb(bb).is_jump() && !code.bb(bb).instrs.is_empty() {
                code.split(bb, 0);
            }
        });
        assert!(visited >= 5);
    }

    #[test]
    fn test_dominator_order() {
        let code = diamond();
        let cfg = CFG::new(&code);
        let dom = DominanceGraph::new(&code, &cfg);
        let mut order = Vec::new();
        DominatorTreeVisitor::run(&dom, |bb| order.push(bb));
        // Entry first; the merge block comes after its dominator
        assert_eq!(order[0], code.entry);
        let pos = |x: BBId| order.iter().position(|b| *b == x).unwrap();
        let d = *order.last().unwrap();
        assert!(pos(code.entry) < pos(d));
    }
}
