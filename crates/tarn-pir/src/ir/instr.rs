//! Instructions.
//!
//! An instruction is a tag, a uniform argument list of `Value` edges, a
//! result type, and an effect set. The per-tag argument layout is documented
//! on `Tag`; the slot helpers here are the single source of truth for where
//! the environment and frame-state edges live.

use tarn_bytecode::value::{Builtin, SexpKind};
use tarn_bytecode::SrcIdx;

use super::bb::BBId;
use super::effects::Effects;
use super::tag::Tag;
use super::ty::{PirType, RTypeSet};
use super::value::Value;
use tarn_bytecode::feedback::ObservedType;

/// One PIR instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    pub tag: Tag,
    pub args: Vec<Value>,
    pub ty: PirType,
    pub effects: Effects,
    /// Owning block
    pub bb: BBId,
    pub src: Option<SrcIdx>,
    /// Runtime type feedback attached by the front end
    pub type_feedback: Option<ObservedType>,
    pub deleted: bool,
}

impl Instr {
    pub fn new(tag: Tag, args: Vec<Value>, bb: BBId) -> Instr {
        let effects = base_effects(&tag);
        Instr {
            tag,
            args,
            ty: PirType::voyd(),
            effects,
            bb,
            src: None,
            type_feedback: None,
            deleted: false,
        }
    }

    pub fn produces_result(&self) -> bool {
        !self.ty.is_void()
    }

    /// Slot of the environment argument, if the instruction has one.
    pub fn env_slot(&self) -> Option<usize> {
        use Tag::*;
        match &self.tag {
            LdVar { .. } | LdVarSuper { .. } | LdFun { .. } | Missing { .. } => Some(0),
            StVar { .. } | StVarSuper { .. } => Some(1),
            // MkEnv's "environment" is the parent it closes over
            MkEnv { names, .. } => Some(names.len()),
            MkArg { .. } => Some(1),
            MkFunCls { .. } => Some(0),
            NonLocalReturn => Some(1),
            Call { nargs, .. } => Some(1 + nargs),
            NamedCall { names, .. } => Some(1 + names.len()),
            StaticCall { nargs, .. } => Some(*nargs),
            CallBuiltin { nargs, .. } => Some(*nargs),
            FrameState { stack_len, .. } => Some(*stack_len),
            Add | Sub | Mul | Div | IDiv | Mod | Pow | Lt | Lte | Gt | Gte | Eq | Neq | LAnd
            | LOr | Colon | Extract1 | Extract2 => Some(2),
            Not | Plus | Minus => Some(1),
            Subassign1 | Subassign2 => Some(3),
            _ => None,
        }
    }

    pub fn has_env(&self) -> bool {
        self.env_slot().is_some()
    }

    pub fn env(&self) -> Option<Value> {
        self.env_slot().map(|i| self.args[i])
    }

    pub fn set_env(&mut self, env: Value) {
        if let Some(i) = self.env_slot() {
            self.args[i] = env;
        }
    }

    /// Slot of the frame-state argument, if present.
    pub fn fs_slot(&self) -> Option<usize> {
        use Tag::*;
        match &self.tag {
            Force { has_fs: true } => Some(1),
            Call { nargs, has_fs: true } => Some(2 + nargs),
            NamedCall { names, has_fs: true } => Some(2 + names.len()),
            StaticCall { nargs, has_fs: true, .. } => Some(nargs + 1),
            FrameState { stack_len, has_parent: true, .. } => Some(stack_len + 1),
            Deopt => Some(0),
            _ => None,
        }
    }

    pub fn frame_state(&self) -> Option<Value> {
        self.fs_slot().map(|i| self.args[i])
    }

    /// Drop the frame-state edge, if any (after speculation is closed).
    pub fn drop_frame_state(&mut self) {
        use Tag::*;
        if let Some(slot) = self.fs_slot() {
            match &mut self.tag {
                Force { has_fs } => *has_fs = false,
                Call { has_fs, .. } | NamedCall { has_fs, .. } | StaticCall { has_fs, .. } => {
                    *has_fs = false
                }
                _ => return,
            }
            self.args.remove(slot);
        }
    }

    /// The call arguments of a call instruction (excluding callee, env, fs).
    pub fn call_args(&self) -> &[Value] {
        use Tag::*;
        match &self.tag {
            Call { nargs, .. } => &self.args[1..1 + nargs],
            NamedCall { names, .. } => &self.args[1..1 + names.len()],
            StaticCall { nargs, .. } => &self.args[..*nargs],
            CallBuiltin { nargs, .. } | CallSafeBuiltin { nargs, .. } => &self.args[..*nargs],
            _ => &[],
        }
    }

    pub fn callee(&self) -> Option<Value> {
        match &self.tag {
            Tag::Call { .. } | Tag::NamedCall { .. } => Some(self.args[0]),
            _ => None,
        }
    }

    /// Whether the only use of the environment is S3/S4 dispatch.
    pub fn env_only_for_obj(&self) -> bool {
        self.tag.env_only_for_obj()
    }

    /// Expected type of the argument in the given slot; used by cast
    /// insertion and the verifier.
    pub fn expected_arg_type(&self, slot: usize) -> PirType {
        use Tag::*;
        if Some(slot) == self.env_slot() {
            return PirType::env();
        }
        if Some(slot) == self.fs_slot() {
            return PirType::frame_state();
        }
        match &self.tag {
            Branch => PirType::test(),
            Assume { .. } => {
                if slot == 0 {
                    PirType::test()
                } else {
                    PirType::checkpoint()
                }
            }
            Force { .. } => PirType::any(),
            Return | NonLocalReturn => PirType::val(),
            StVar { .. } | StVarSuper { .. } => PirType::val().or_promise_wrapped(),
            Add | Sub | Mul | Div | IDiv | Mod | Pow | Lt | Lte | Gt | Gte | Eq | Neq | LAnd
            | LOr | Colon | Not | Plus | Minus | Extract1 | Extract2 | Subassign1 | Subassign2
            | Length | ForSeqSize | AsLogical | CheckTrueFalse | IsKind { .. } | ChkMissing => {
                PirType::val()
            }
            _ => PirType::any(),
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.tag, Tag::Phi { .. })
    }

    /// Whether removing this instruction is unobservable (given its uses are
    /// gone).
    pub fn is_removable(&self) -> bool {
        !self.effects.observable() && !self.tag.is_branching() && !self.tag.is_exit()
    }
}

/// Effect set an instruction starts with; `update_type_and_effects` may
/// shrink it as operand types sharpen.
pub fn base_effects(tag: &Tag) -> Effects {
    use Tag::*;
    match tag {
        LdVar { .. } | LdVarSuper { .. } => Effects::READS_ENV | Effects::ERROR,
        // Function lookup may force promises on the way
        LdFun { .. } => Effects::READS_ENV | Effects::ERROR | Effects::EXECUTES_CODE,
        Missing { .. } => Effects::READS_ENV,
        StVar { .. } | StVarSuper { .. } => Effects::WRITES_ENV,
        Force { .. } => Effects::any_call(),
        MkFunCls { .. } => Effects::LEAKS_ENV,
        Assume { .. } => Effects::TRIGGERS_DEOPT,
        Deopt | ScheduledDeopt { .. } => Effects::TRIGGERS_DEOPT,
        RecordDeoptReason { .. } => Effects::TRIGGERS_DEOPT,
        Call { .. } | NamedCall { .. } | StaticCall { .. } => Effects::any_call(),
        CallBuiltin { builtin, .. } => {
            let mut e = Effects::EXECUTES_CODE
                | Effects::ERROR
                | Effects::WARN
                | Effects::VISIBILITY
                | Effects::READS_ENV;
            if builtin.is_reflective() {
                e |= Effects::REFLECTION | Effects::LEAKS_ENV | Effects::WRITES_ENV;
            }
            e
        }
        CallSafeBuiltin { .. } => Effects::empty(),
        Add | Sub | Mul | Div | IDiv | Mod | Pow | Lt | Lte | Gt | Gte | Eq | Neq | LAnd | LOr
        | Colon | Not | Plus | Minus | Extract1 | Extract2 | Subassign1 | Subassign2 => {
            // Arbitrary effects while an operand may dispatch on a class
            Effects::any_call() - Effects::VISIBILITY
        }
        ForSeqSize | CheckTrueFalse | AsLogical | ChkMissing => Effects::ERROR | Effects::WARN,
        Visible | Invisible => Effects::VISIBILITY,
        NonLocalReturn => Effects::LEAKS_ENV,
        _ => Effects::empty(),
    }
}

/// Initial result type for a freshly created instruction. Types that depend
/// on pool contents or the compilation context are refined by the creator.
pub fn initial_type(tag: &Tag, args: &[Value], arg_ty: impl Fn(&Value) -> PirType) -> PirType {
    use Tag::*;
    match tag {
        LdConst { .. } => PirType::val(),
        LdArg { .. } => PirType::any(),
        LdFunctionEnv | MkEnv { .. } => PirType::env(),
        LdVar { .. } | LdVarSuper { .. } => PirType::any(),
        LdFun { .. } => PirType::closure().scalar(),
        Missing { .. } => PirType::simple_lgl(),
        StVar { .. } | StVarSuper { .. } => PirType::voyd(),
        Force { .. } => arg_ty(&args[0]).forced(),
        // An argument with a known eager value can no longer be lazy
        MkArg { .. } => {
            if args[0] == Value::Missing {
                PirType::val_or_lazy()
            } else {
                PirType::promise_wrapped_val()
            }
        }
        MkFunCls { .. } => PirType::closure().scalar().not_object(),
        CastType { .. } => PirType::any(),
        Branch | Return | NonLocalReturn | Deopt | ScheduledDeopt { .. } | Unreachable
        | Assume { .. } | RecordDeoptReason { .. } | Visible | Invisible | Nop => PirType::voyd(),
        Checkpoint => PirType::checkpoint(),
        FrameState { .. } => PirType::frame_state(),
        Call { .. } | NamedCall { .. } | StaticCall { .. } | CallBuiltin { .. } => PirType::val(),
        CallSafeBuiltin { builtin, .. } => safe_builtin_type(*builtin),
        Add | Sub | Mul | Div | IDiv | Mod | Pow => PirType::val(),
        Lt | Lte | Gt | Gte | Eq | Neq => PirType::r(RTypeSet::LGL).not_object(),
        LAnd | LOr => PirType::r(RTypeSet::LGL).scalar().not_object(),
        Colon => PirType::num().not_object().not_na(),
        Not => PirType::r(RTypeSet::LGL).not_object(),
        Plus | Minus => PirType::val(),
        Extract1 | Extract2 | Subassign1 | Subassign2 => PirType::val(),
        Length => PirType::int().scalar().not_object().not_na(),
        ForSeqSize => PirType::int().scalar().not_object().not_na(),
        Identical | CheckTrueFalse | TypeTest { .. } => PirType::test(),
        AsLogical => PirType::r(RTypeSet::LGL).not_object(),
        IsKind { .. } => PirType::simple_lgl(),
        ChkMissing => arg_ty(&args[0]).not_missing(),
        Phi { .. } => args
            .iter()
            .fold(PirType::bottom(), |acc, v| acc.union(&arg_ty(v))),
        PirCopy => arg_ty(&args[0]),
        DotsList { .. } => PirType::list(),
    }
}

/// Result types for safe builtins the optimizer reasons about.
pub fn safe_builtin_type(builtin: Builtin) -> PirType {
    use Builtin::*;
    match builtin {
        Length => PirType::int().scalar().not_object().not_na(),
        IsFunction | IsCharacter | IsDouble | IsInteger | IsLogical | IsObject | IsNa | AnyNa => {
            PirType::simple_lgl()
        }
        BitwAnd | BitwOr | BitwXor => PirType::int().not_object(),
        _ => PirType::val(),
    }
}

/// The `SexpKind` an `IsKind` test answers for a builtin of the `is.*`
/// family, if any.
pub fn builtin_is_kind(builtin: Builtin) -> Option<SexpKind> {
    use Builtin::*;
    match builtin {
        IsFunction => Some(SexpKind::Closure),
        IsCharacter => Some(SexpKind::Str),
        IsDouble => Some(SexpKind::Real),
        IsInteger => Some(SexpKind::Int),
        IsLogical => Some(SexpKind::Lgl),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_slots() {
        let i = Instr::new(Tag::LdVar { name: tarn_bytecode::Symbol(7) }, vec![Value::BaseEnv], BBId(0));
        assert_eq!(i.env_slot(), Some(0));
        assert_eq!(i.env(), Some(Value::BaseEnv));

        let add = Instr::new(Tag::Add, vec![Value::True, Value::False, Value::ElidedEnv], BBId(0));
        assert_eq!(add.env_slot(), Some(2));
        assert!(add.env_only_for_obj());

        let call = Instr::new(
            Tag::Call { nargs: 2, has_fs: true },
            vec![Value::Nil, Value::True, Value::False, Value::BaseEnv, Value::Missing],
            BBId(0),
        );
        assert_eq!(call.env_slot(), Some(3));
        assert_eq!(call.fs_slot(), Some(4));
        assert_eq!(call.call_args().len(), 2);
    }

    #[test]
    fn test_drop_frame_state() {
        let mut call = Instr::new(
            Tag::Call { nargs: 1, has_fs: true },
            vec![Value::Nil, Value::True, Value::BaseEnv, Value::Missing],
            BBId(0),
        );
        call.drop_frame_state();
        assert_eq!(call.args.len(), 3);
        assert_eq!(call.fs_slot(), None);
        assert_eq!(call.env_slot(), Some(2));
    }

    #[test]
    fn test_base_effects() {
        assert!(base_effects(&Tag::StVar { name: tarn_bytecode::Symbol(0) })
            .contains(Effects::WRITES_ENV));
        assert!(base_effects(&Tag::Add).taints_env());
        assert_eq!(base_effects(&Tag::Phi { inputs: vec![] }), Effects::empty());
        assert_eq!(
            base_effects(&Tag::CallSafeBuiltin { builtin: Builtin::Length, nargs: 1 }),
            Effects::empty()
        );
    }

    #[test]
    fn test_initial_types() {
        let t = initial_type(&Tag::Length, &[Value::Nil], |v| v.ty_standalone());
        assert!(t.is_a(&PirType::int()));
        let t = initial_type(&Tag::Identical, &[Value::True, Value::False], |v| v.ty_standalone());
        assert_eq!(t, PirType::test());
    }
}

#[cfg(test)]
impl Value {
    /// Type of a singleton value without a `Code` (test helper).
    pub(crate) fn ty_standalone(&self) -> PirType {
        match self {
            Value::True | Value::False => PirType::simple_lgl(),
            Value::Nil => PirType::r(RTypeSet::NIL),
            Value::Missing => PirType::missing(),
            _ => PirType::any(),
        }
    }
}
