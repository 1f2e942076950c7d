//! Basic blocks.
//!
//! A block is an ordered instruction list plus two successor slots, giving
//! three shapes: exit (no successors; last instruction is `Return`, `Deopt`,
//! or `Unreachable`), jump (`next0` only), and branch (both, last is a
//! branching instruction).

use super::value::InstrId;

/// Dense block id within a `Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BBId(pub u32);

impl std::fmt::Display for BBId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A basic block.
#[derive(Debug, Clone, Default)]
pub struct BB {
    pub instrs: Vec<InstrId>,
    pub next0: Option<BBId>,
    pub next1: Option<BBId>,
    pub deleted: bool,
}

impl BB {
    pub fn successors(&self) -> impl Iterator<Item = BBId> + '_ {
        self.next0.into_iter().chain(self.next1)
    }

    pub fn is_exit(&self) -> bool {
        self.next0.is_none() && self.next1.is_none()
    }

    pub fn is_branch(&self) -> bool {
        self.next0.is_some() && self.next1.is_some()
    }

    pub fn is_jump(&self) -> bool {
        self.next0.is_some() && self.next1.is_none()
    }

    pub fn last(&self) -> Option<InstrId> {
        self.instrs.last().copied()
    }

    /// Replace a successor edge in place.
    pub fn replace_successor(&mut self, from: BBId, to: BBId) {
        if self.next0 == Some(from) {
            self.next0 = Some(to);
        }
        if self.next1 == Some(from) {
            self.next1 = Some(to);
        }
    }
}
