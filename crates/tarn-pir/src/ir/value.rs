//! Value edges.
//!
//! An instruction argument is either another instruction (by arena id) or one
//! of a small set of process-global singletons. Singletons are immutable and
//! shared; instructions belong to exactly one `Code`.

use super::code::Code;
use super::ty::{PirType, RTypeSet};

/// Arena id of an instruction within its `Code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// Id of a promise within its owning `ClosureVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseId(pub u16);

/// Placeholder left behind when a required edge has been dropped on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tombstone {
    /// A frame state that a cleanup pass removed
    FrameState,
    /// A closure value that is no longer tracked
    Closure,
    /// An edge in code proven unreachable
    Unreachable,
}

/// A value edge: an instruction or a singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Instr(InstrId),
    True,
    False,
    Nil,
    /// The missing-argument marker
    Missing,
    /// The unbound-value marker
    Unbound,
    Tombstone(Tombstone),
    /// Environment of code that is not yet part of a closure (used while
    /// inlining; rewritten to a concrete environment by the inliner)
    NotClosedEnv,
    /// Environment proven unnecessary and removed
    ElidedEnv,
    /// The static environment the closure being compiled was defined in
    BaseEnv,
}

impl Value {
    pub fn as_instr(&self) -> Option<InstrId> {
        match self {
            Value::Instr(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this value denotes an environment (concrete or singleton).
    pub fn is_env(&self, code: &Code) -> bool {
        match self {
            Value::NotClosedEnv | Value::ElidedEnv | Value::BaseEnv => true,
            Value::Instr(id) => code.instr(*id).ty.is_a(&PirType::env()),
            _ => false,
        }
    }

    /// The static type of this value.
    pub fn ty(&self, code: &Code) -> PirType {
        match self {
            Value::Instr(id) => code.instr(*id).ty,
            Value::True | Value::False => PirType::simple_lgl(),
            Value::Nil => PirType::r(RTypeSet::NIL).scalar().not_object().not_na(),
            Value::Missing => PirType::missing(),
            Value::Unbound => PirType::r(RTypeSet::UNBOUND),
            Value::Tombstone(_) => PirType::bottom(),
            Value::NotClosedEnv | Value::ElidedEnv | Value::BaseEnv => PirType::env(),
        }
    }

    /// Follow `Force` and cast chains to the underlying value.
    pub fn followed(&self, code: &Code) -> Value {
        let mut v = *self;
        loop {
            match v {
                Value::Instr(id) => match code.instr(id).tag {
                    super::tag::Tag::Force { .. } | super::tag::Tag::CastType { .. }
                    | super::tag::Tag::PirCopy => {
                        v = code.instr(id).args[0];
                    }
                    _ => return v,
                },
                _ => return v,
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Instr(id) => write!(f, "%{}", id.0),
            Value::True => write!(f, "true"),
            Value::False => write!(f, "false"),
            Value::Nil => write!(f, "nil"),
            Value::Missing => write!(f, "missing"),
            Value::Unbound => write!(f, "unbound"),
            Value::Tombstone(Tombstone::FrameState) => write!(f, "†fs"),
            Value::Tombstone(Tombstone::Closure) => write!(f, "†cls"),
            Value::Tombstone(Tombstone::Unreachable) => write!(f, "†"),
            Value::NotClosedEnv => write!(f, "?env"),
            Value::ElidedEnv => write!(f, "elided"),
            Value::BaseEnv => write!(f, "baseenv"),
        }
    }
}
