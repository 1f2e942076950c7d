//! Static analyses.
//!
//! `framework` is a generic forward fixed-point engine over a user-defined
//! abstract state; the sibling modules are the concrete analyses built on it.

pub mod abstract_value;
pub mod checkpoints;
pub mod framework;
pub mod last_env;
pub mod range;
pub mod scope;

pub use framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
