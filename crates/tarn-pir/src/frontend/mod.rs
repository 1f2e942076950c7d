//! Front end: baseline bytecode → PIR.
//!
//! `lift` is the symbolic stack interpreter that rebuilds SSA; `args` is
//! positional/named argument matching against a callee's formals, shared
//! with the match-call-args pass.

pub mod args;
pub mod lift;

pub use args::{match_call_args, MatchedArg};
pub use lift::{lift_function, CompileRequest, LiftError};
