//! Instruction tags.
//!
//! The closed opcode vocabulary of PIR. Each variant carries its non-value
//! payload (names, indices, shapes); value operands live in the uniform
//! argument list on `Instr`, with the per-tag layout documented there.

use tarn_bytecode::context::Context;
use tarn_bytecode::module::{CodeRef, FunId, PoolIdx};
use tarn_bytecode::symbols::Symbol;
use tarn_bytecode::value::{Builtin, SexpKind};

use super::ty::PirType;
use super::value::PromiseId;
use crate::ir::bb::BBId;

/// Why a deopt was scheduled; recorded for diagnostics and feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptReason {
    DeadBranchReached,
    TypecheckFailed,
    CalleeChanged,
    EnvStubMaterialized,
    Unknown,
}

/// What a `TypeTest` checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTestKind {
    /// Value carries a class attribute
    Object,
    /// Environment is still a stub (was never materialized)
    EnvStub,
    /// Value is an instance of the given type
    IsA(PirType),
}

/// Shape of one frame inside a `ScheduledDeopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub code: CodeRef,
    pub pc: u32,
    pub stack_len: usize,
    pub in_promise: bool,
}

/// The instruction opcode with its immediate payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    // ===== Constants and arguments =====
    LdConst { idx: PoolIdx },
    LdArg { index: usize },
    /// Placeholder for a promise's lexical environment; replaced with the
    /// captured environment when the promise is inlined
    LdFunctionEnv,

    // ===== Environment access =====
    /// args: [env]
    LdVar { name: Symbol },
    /// args: [env]
    LdVarSuper { name: Symbol },
    /// args: [env]; skips non-closure bindings up the chain
    LdFun { name: Symbol },
    /// args: [val, env]
    StVar { name: Symbol },
    /// args: [val, env]
    StVarSuper { name: Symbol },
    /// args: [env]; TRUE if the binding is missing
    Missing { name: Symbol },
    /// args: [vals..., parent]; names parallel to vals
    MkEnv { names: Vec<Symbol>, stub: bool },

    // ===== Promises =====
    /// args: [val] or [val, fs]
    Force { has_fs: bool },
    /// args: [eager_or_missing, env]
    MkArg { prom: PromiseId },
    /// args: [env]
    MkFunCls { fun: FunId },

    // ===== Casts =====
    /// args: [val]; `up` widens, otherwise narrows to `Instr::ty`
    CastType { up: bool, from: PirType },

    // ===== Control =====
    /// args: [test]; next0 = true branch, next1 = false branch
    Branch,
    /// args: []; next0 = continue, next1 = deopt path
    Checkpoint,
    /// args: [cond, cp]; aborts to the checkpoint's deopt path when cond is
    /// false (or true, with `not`)
    Assume { not: bool, reason: DeoptReason },
    /// args: [fs]
    Deopt,
    /// Backend form of Deopt; args: per frame [stack..., env], frames
    /// outermost first
    ScheduledDeopt { frames: Vec<FrameShape> },
    /// args: [stack..., env] or [stack..., env, parent_fs]
    FrameState { code: CodeRef, pc: u32, stack_len: usize, in_promise: bool, has_parent: bool },
    /// args: [val]; side-effecting so it cannot be dropped before the deopt
    /// it explains
    RecordDeoptReason { reason: DeoptReason },
    /// args: [val]
    Return,
    /// args: [val, env]
    NonLocalReturn,
    Unreachable,

    // ===== Calls =====
    /// args: [callee, args..., env] or [callee, args..., env, fs]
    Call { nargs: usize, has_fs: bool },
    /// args: [callee, args..., env] or [callee, args..., env, fs]
    NamedCall { names: Vec<Option<Symbol>>, has_fs: bool },
    /// args: [args..., env] or [args..., env, fs]
    StaticCall { fun: FunId, ctx: Context, nargs: usize, has_fs: bool },
    /// args: [args..., env]
    CallBuiltin { builtin: Builtin, nargs: usize },
    /// args: [args...]; known free of environment access and errors
    CallSafeBuiltin { builtin: Builtin, nargs: usize },

    // ===== Binary operations; args: [lhs, rhs, env] =====
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
    LAnd,
    LOr,
    Colon,

    // ===== Unary operations; args: [val, env] =====
    Not,
    Plus,
    Minus,

    // ===== Vectors =====
    /// args: [vec, idx, env]
    Extract1,
    /// args: [vec, idx, env]
    Extract2,
    /// args: [vec, idx, val, env]
    Subassign1,
    /// args: [vec, idx, val, env]
    Subassign2,
    /// args: [val]
    Length,
    /// args: [val]
    ForSeqSize,

    // ===== Tests and coercions =====
    /// args: [a, b]; bit-exact identity, result is a machine test
    Identical,
    /// args: [val]; coerce to a machine test, error on NA
    CheckTrueFalse,
    /// args: [val]
    AsLogical,
    /// args: [val]; the `is.*` family, result is an R logical
    IsKind { kind: SexpKind },
    /// args: [val]; result is a machine test, used under Assume
    TypeTest { test: TypeTestKind },
    /// args: [val]; error if missing
    ChkMissing,

    // ===== SSA =====
    /// args: [vals...]; `inputs[i]` is the block `args[i]` flows in from
    Phi { inputs: Vec<BBId> },
    /// args: [val]; backend copy for phi lowering
    PirCopy,
    /// args: [vals...]; `...` placeholder for calls into dots-taking callees
    DotsList { names: Vec<Option<Symbol>> },

    // ===== Misc =====
    Visible,
    Invisible,
    Nop,
}

impl Tag {
    /// Short mnemonic for printing.
    pub fn name(&self) -> &'static str {
        use Tag::*;
        match self {
            LdConst { .. } => "ldconst",
            LdArg { .. } => "ldarg",
            LdFunctionEnv => "ldfunctionenv",
            LdVar { .. } => "ldvar",
            LdVarSuper { .. } => "ldvarsuper",
            LdFun { .. } => "ldfun",
            StVar { .. } => "stvar",
            StVarSuper { .. } => "stvarsuper",
            Missing { .. } => "missing",
            MkEnv { .. } => "mkenv",
            Force { .. } => "force",
            MkArg { .. } => "mkarg",
            MkFunCls { .. } => "mkfuncls",
            CastType { .. } => "casttype",
            Branch => "branch",
            Checkpoint => "checkpoint",
            Assume { .. } => "assume",
            Deopt => "deopt",
            ScheduledDeopt { .. } => "scheduleddeopt",
            FrameState { .. } => "framestate",
            RecordDeoptReason { .. } => "recorddeoptreason",
            Return => "return",
            NonLocalReturn => "nonlocalreturn",
            Unreachable => "unreachable",
            Call { .. } => "call",
            NamedCall { .. } => "namedcall",
            StaticCall { .. } => "staticcall",
            CallBuiltin { .. } => "callbuiltin",
            CallSafeBuiltin { .. } => "callsafebuiltin",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            IDiv => "idiv",
            Mod => "mod",
            Pow => "pow",
            Lt => "lt",
            Lte => "lte",
            Gt => "gt",
            Gte => "gte",
            Eq => "eq",
            Neq => "neq",
            LAnd => "land",
            LOr => "lor",
            Colon => "colon",
            Not => "not",
            Plus => "plus",
            Minus => "minus",
            Extract1 => "extract1",
            Extract2 => "extract2",
            Subassign1 => "subassign1",
            Subassign2 => "subassign2",
            Length => "length",
            ForSeqSize => "forseqsize",
            Identical => "identical",
            CheckTrueFalse => "checktruefalse",
            AsLogical => "aslogical",
            IsKind { .. } => "iskind",
            TypeTest { .. } => "typetest",
            ChkMissing => "chkmissing",
            Phi { .. } => "phi",
            PirCopy => "copy",
            DotsList { .. } => "dotslist",
            Visible => "visible",
            Invisible => "invisible",
            Nop => "nop",
        }
    }

    pub fn is_binop(&self) -> bool {
        use Tag::*;
        matches!(
            self,
            Add | Sub | Mul | Div | IDiv | Mod | Pow | Lt | Lte | Gt | Gte | Eq | Neq | LAnd
                | LOr | Colon
        )
    }

    pub fn is_unop(&self) -> bool {
        matches!(self, Tag::Not | Tag::Plus | Tag::Minus)
    }

    pub fn is_comparison(&self) -> bool {
        use Tag::*;
        matches!(self, Lt | Lte | Gt | Gte | Eq | Neq)
    }

    pub fn is_call(&self) -> bool {
        use Tag::*;
        matches!(
            self,
            Call { .. } | NamedCall { .. } | StaticCall { .. } | CallBuiltin { .. }
                | CallSafeBuiltin { .. }
        )
    }

    /// Instructions with two successor slots.
    pub fn is_branching(&self) -> bool {
        matches!(self, Tag::Branch | Tag::Checkpoint)
    }

    /// Instructions that end a block with no successors.
    pub fn is_exit(&self) -> bool {
        use Tag::*;
        matches!(self, Return | NonLocalReturn | Deopt | ScheduledDeopt { .. } | Unreachable)
    }

    /// Whether the environment argument exists only for object dispatch; such
    /// instructions can run without one when no operand is an object.
    pub fn env_only_for_obj(&self) -> bool {
        use Tag::*;
        self.is_binop()
            || self.is_unop()
            || matches!(self, Extract1 | Extract2 | Subassign1 | Subassign2)
    }
}
