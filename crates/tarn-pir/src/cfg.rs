//! Control-flow queries over a `Code`: predecessors, dominance, dominance
//! frontiers, and natural-loop detection.
//!
//! All structures are snapshots; recompute them after a pass mutates the
//! block graph.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::bb::BBId;
use crate::ir::code::Code;

/// Predecessor sets.
#[derive(Debug)]
pub struct CFG {
    preds: FxHashMap<BBId, Vec<BBId>>,
    /// Blocks reachable from the entry, in discovery order
    reachable: Vec<BBId>,
}

impl CFG {
    pub fn new(code: &Code) -> CFG {
        let reachable = code.reachable_from(code.entry);
        let mut preds: FxHashMap<BBId, Vec<BBId>> = FxHashMap::default();
        for bb in &reachable {
            preds.entry(*bb).or_default();
        }
        for bb in &reachable {
            for succ in code.bb(*bb).successors() {
                preds.entry(succ).or_default().push(*bb);
            }
        }
        CFG { preds, reachable }
    }

    pub fn preds(&self, bb: BBId) -> &[BBId] {
        self.preds.get(&bb).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn is_merge(&self, bb: BBId) -> bool {
        self.preds(bb).len() > 1
    }

    pub fn reachable(&self) -> &[BBId] {
        &self.reachable
    }

    pub fn is_reachable(&self, bb: BBId) -> bool {
        self.preds.contains_key(&bb)
    }

    /// The transitive predecessor set of a block (not including itself
    /// unless it sits on a cycle through itself).
    pub fn transitive_preds(&self, bb: BBId) -> FxHashSet<BBId> {
        let mut out = FxHashSet::default();
        let mut work: Vec<BBId> = self.preds(bb).to_vec();
        while let Some(p) = work.pop() {
            if out.insert(p) {
                work.extend_from_slice(self.preds(p));
            }
        }
        out
    }
}

/// Dominator tree, by iterated intersection over predecessor dominator sets.
#[derive(Debug)]
pub struct DominanceGraph {
    /// Immediate dominator of each reachable block (entry maps to itself)
    idom: FxHashMap<BBId, BBId>,
    entry: BBId,
}

impl DominanceGraph {
    pub fn new(code: &Code, cfg: &CFG) -> DominanceGraph {
        let blocks = cfg.reachable();
        let index: FxHashMap<BBId, usize> =
            blocks.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let n = blocks.len();

        // dom[i] = set of blocks dominating blocks[i], as bit rows
        let words = n.div_ceil(64);
        let full = vec![u64::MAX; words];
        let mut dom: Vec<Vec<u64>> = vec![full; n];
        let entry_idx = index[&code.entry];
        dom[entry_idx] = vec![0; words];
        set_bit(&mut dom[entry_idx], entry_idx);

        let mut changed = true;
        while changed {
            changed = false;
            for (i, bb) in blocks.iter().enumerate() {
                if i == entry_idx {
                    continue;
                }
                let mut new = vec![u64::MAX; words];
                for p in cfg.preds(*bb) {
                    if let Some(&pi) = index.get(p) {
                        for (w, pw) in new.iter_mut().zip(dom[pi].iter()) {
                            *w &= pw;
                        }
                    }
                }
                set_bit(&mut new, i);
                if new != dom[i] {
                    dom[i] = new;
                    changed = true;
                }
            }
        }

        // Immediate dominator: the strict dominator dominated by all other
        // strict dominators
        let mut idom: FxHashMap<BBId, BBId> = FxHashMap::default();
        idom.insert(code.entry, code.entry);
        for (i, bb) in blocks.iter().enumerate() {
            if i == entry_idx {
                continue;
            }
            let strict: Vec<usize> =
                (0..n).filter(|j| *j != i && get_bit(&dom[i], *j)).collect();
            let imm = strict
                .iter()
                .find(|&&c| strict.iter().all(|&o| get_bit(&dom[c], o)))
                .copied();
            if let Some(c) = imm {
                idom.insert(*bb, blocks[c]);
            }
        }

        DominanceGraph { idom, entry: code.entry }
    }

    pub fn immediate_dominator(&self, bb: BBId) -> Option<BBId> {
        if bb == self.entry {
            return None;
        }
        self.idom.get(&bb).copied()
    }

    pub fn immediately_dominates(&self, a: BBId, b: BBId) -> bool {
        self.immediate_dominator(b) == Some(a)
    }

    /// Whether `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BBId, b: BBId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.immediate_dominator(cur) {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    /// All dominators of a block, innermost first.
    pub fn dominators(&self, bb: BBId) -> Vec<BBId> {
        let mut out = vec![bb];
        let mut cur = bb;
        while let Some(next) = self.immediate_dominator(cur) {
            out.push(next);
            cur = next;
        }
        out
    }

    /// Children in the dominator tree.
    pub fn dominator_tree_next(&self, bb: BBId) -> Vec<BBId> {
        let mut out: Vec<BBId> = self
            .idom
            .iter()
            .filter(|(b, d)| **d == bb && **b != bb)
            .map(|(b, _)| *b)
            .collect();
        out.sort();
        out
    }

    /// Dominance preorder starting at the entry.
    pub fn preorder(&self) -> Vec<BBId> {
        let mut out = Vec::new();
        let mut work = vec![self.entry];
        while let Some(bb) = work.pop() {
            out.push(bb);
            let mut kids = self.dominator_tree_next(bb);
            kids.reverse();
            work.extend(kids);
        }
        out
    }
}

fn set_bit(row: &mut [u64], i: usize) {
    row[i / 64] |= 1 << (i % 64);
}

fn get_bit(row: &[u64], i: usize) -> bool {
    row[i / 64] & (1 << (i % 64)) != 0
}

/// Dominance frontiers.
#[derive(Debug)]
pub struct DominanceFrontier {
    frontier: FxHashMap<BBId, FxHashSet<BBId>>,
}

impl DominanceFrontier {
    pub fn new(cfg: &CFG, dom: &DominanceGraph) -> DominanceFrontier {
        let mut frontier: FxHashMap<BBId, FxHashSet<BBId>> = FxHashMap::default();
        for bb in cfg.reachable() {
            let preds = cfg.preds(*bb);
            if preds.len() < 2 {
                continue;
            }
            let Some(idom) = dom.immediate_dominator(*bb) else { continue };
            for p in preds {
                let mut runner = *p;
                while runner != idom {
                    frontier.entry(runner).or_default().insert(*bb);
                    match dom.immediate_dominator(runner) {
                        Some(next) => runner = next,
                        None => break,
                    }
                }
            }
        }
        DominanceFrontier { frontier }
    }

    pub fn at(&self, bb: BBId) -> impl Iterator<Item = BBId> + '_ {
        self.frontier.get(&bb).into_iter().flatten().copied()
    }
}

/// A natural loop: a back-edge target plus the blocks that reach the
/// back-edge source without passing through the header.
#[derive(Debug)]
pub struct NaturalLoop {
    pub header: BBId,
    pub body: FxHashSet<BBId>,
}

impl NaturalLoop {
    /// The unique predecessor of the header outside the loop, if one exists.
    pub fn preheader(&self, cfg: &CFG) -> Option<BBId> {
        let outside: Vec<BBId> = cfg
            .preds(self.header)
            .iter()
            .filter(|p| !self.body.contains(p) && **p != self.header)
            .copied()
            .collect();
        match outside.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }

    pub fn contains(&self, bb: BBId) -> bool {
        bb == self.header || self.body.contains(&bb)
    }
}

/// Find all natural loops (back-edges to dominators).
pub fn find_loops(code: &Code, cfg: &CFG, dom: &DominanceGraph) -> Vec<NaturalLoop> {
    let mut loops: FxHashMap<BBId, NaturalLoop> = FxHashMap::default();
    for bb in cfg.reachable() {
        for succ in code.bb(*bb).successors() {
            if dom.dominates(succ, *bb) {
                // Back-edge bb -> succ
                let l = loops
                    .entry(succ)
                    .or_insert_with(|| NaturalLoop { header: succ, body: FxHashSet::default() });
                // Walk backwards from the source collecting the body
                let mut work = vec![*bb];
                while let Some(cur) = work.pop() {
                    if cur != succ && l.body.insert(cur) {
                        work.extend_from_slice(cfg.preds(cur));
                    }
                }
            }
        }
    }
    let mut out: Vec<NaturalLoop> = loops.into_values().collect();
    out.sort_by_key(|l| l.header);
    out
}
