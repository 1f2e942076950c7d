//! Baseline bytecode definitions for the Tarn VM.
//!
//! The baseline tier is a stack bytecode with inline runtime feedback. This
//! crate owns everything both tiers need to agree on:
//! - The opcode set and operand encodings, with a decoder and an encoder
//! - Code objects (`BcCode`), functions, modules, constant pool, symbols
//! - Runtime feedback slots (test / type / call observations)
//! - Deoptimization metadata records consumed by the `Deopt` opcode
//! - The assumption `Context` used to key optimized versions in dispatch
//!   tables

pub mod context;
pub mod decoder;
pub mod encoder;
pub mod feedback;
pub mod module;
pub mod opcode;
pub mod symbols;
pub mod value;

pub use context::{ArgAssumptions, Assumptions, Context, MAX_CONTEXT_ARGS};
pub use decoder::{decode, DecodeError, DecodedInstr, Operands};
pub use encoder::BcBuilder;
pub use feedback::{FeedbackSlot, ObservedCall, ObservedCallee, ObservedTest, ObservedType, TypeRecord};
pub use module::{
    BcCode, BcFunction, BcModule, CallSite, CodeRef, ConstPool, DeoptFrame, DeoptMetadata,
    Formals, FunId, ModuleMeta, PoolIdx, SrcIdx, WhichCode,
};
pub use opcode::Opcode;
pub use symbols::{Symbol, SymbolTable};
pub use value::{BcValue, Builtin, SexpKind};
