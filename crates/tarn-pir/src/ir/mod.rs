//! The PIR intermediate representation.
//!
//! Instructions live in a per-`Code` arena and reference each other through
//! `Value` edges carrying `InstrId`s, never pointers. Blocks own ordered
//! instruction lists and up to two successors. Deletions are staged and
//! reclaimed in bulk so visitors never observe dangling ids.

pub mod bb;
pub mod builder;
pub mod closure;
pub mod code;
pub mod display;
pub mod effects;
pub mod instr;
pub mod module;
pub mod tag;
pub mod ty;
pub mod value;
pub mod verify;
pub mod version;

pub use bb::{BBId, BB};
pub use builder::Builder;
pub use closure::{Closure, ClosureId, DispatchTable, VersionIdx};
pub use code::Code;
pub use effects::Effects;
pub use instr::Instr;
pub use module::Module;
pub use tag::{DeoptReason, FrameShape, Tag, TypeTestKind};
pub use ty::{BaseType, NativeSet, PirType, RTypeSet, TypeFlags};
pub use value::{InstrId, PromiseId, Value};
pub use version::{ClosureVersion, Promise, VersionProperties};
