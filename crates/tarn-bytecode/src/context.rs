//! Assumption contexts.
//!
//! A `Context` is the set of speculative assumptions an optimized closure
//! version was compiled under. The baseline dispatcher computes the caller's
//! context at each call and indexes the callee's dispatch table with it;
//! a version is applicable when the caller's context includes everything the
//! version assumed.

use bitflags::bitflags;

/// Number of argument positions that carry per-position assumptions.
pub const MAX_CONTEXT_ARGS: usize = 6;

bitflags! {
    /// Call-shape assumptions that apply to the call as a whole.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Assumptions: u8 {
        const CORRECT_ORDER_OF_ARGUMENTS = 1 << 0;
        const NOT_TOO_MANY_ARGUMENTS     = 1 << 1;
        const NOT_TOO_FEW_ARGUMENTS      = 1 << 2;
        const NO_EXPLICITLY_MISSING_ARGS = 1 << 3;
        const STATICALLY_ARG_MATCHED     = 1 << 4;
        const NO_REFLECTIVE_ARGUMENT     = 1 << 5;
    }
}

bitflags! {
    /// Per-argument-position assumptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArgAssumptions: u8 {
        /// The argument is already evaluated (not a lazy promise)
        const EAGER          = 1 << 0;
        /// The argument is not an object (no class attribute)
        const NOT_OBJ        = 1 << 1;
        /// The argument is a scalar integer without attributes
        const SIMPLE_INT     = 1 << 2;
        /// The argument is a scalar real without attributes
        const SIMPLE_REAL    = 1 << 3;
        /// Evaluating the argument cannot reflect on the caller
        const NON_REFLECTIVE = 1 << 4;
    }
}

/// A full assumption context: call-shape flags, per-position flags, and the
/// number of trailing missing arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Context {
    pub flags: Assumptions,
    args: [ArgAssumptions; MAX_CONTEXT_ARGS],
    pub missing: u8,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// The weakest context the optimizer accepts: arguments arrive in formal
    /// order and arity is not over-supplied.
    pub fn minimal() -> Context {
        let mut ctx = Context::new();
        ctx.flags |= Assumptions::CORRECT_ORDER_OF_ARGUMENTS | Assumptions::NOT_TOO_MANY_ARGUMENTS;
        ctx
    }

    /// Whether every assumption in `other` also holds here.
    pub fn includes(&self, other: &Context) -> bool {
        self.flags.contains(other.flags)
            && self.missing == other.missing
            && self.args.iter().zip(other.args.iter()).all(|(a, b)| a.contains(*b))
    }

    /// Union of both assumption sets. Missing counts must agree unless one
    /// side has not set any.
    pub fn union(&self, other: &Context) -> Context {
        let mut out = *self;
        out.flags |= other.flags;
        for (a, b) in out.args.iter_mut().zip(other.args.iter()) {
            *a |= *b;
        }
        if out.missing == 0 {
            out.missing = other.missing;
        }
        out
    }

    pub fn arg(&self, i: usize) -> ArgAssumptions {
        if i < MAX_CONTEXT_ARGS {
            self.args[i]
        } else {
            ArgAssumptions::empty()
        }
    }

    pub fn set_arg(&mut self, i: usize, a: ArgAssumptions) {
        if i < MAX_CONTEXT_ARGS {
            self.args[i] |= a;
        }
    }

    pub fn is_eager(&self, i: usize) -> bool {
        self.arg(i).contains(ArgAssumptions::EAGER)
    }

    pub fn set_eager(&mut self, i: usize) {
        self.set_arg(i, ArgAssumptions::EAGER);
    }

    pub fn is_not_obj(&self, i: usize) -> bool {
        self.arg(i).contains(ArgAssumptions::NOT_OBJ)
    }

    pub fn set_not_obj(&mut self, i: usize) {
        self.set_arg(i, ArgAssumptions::NOT_OBJ);
    }

    pub fn is_simple_int(&self, i: usize) -> bool {
        self.arg(i).contains(ArgAssumptions::SIMPLE_INT)
    }

    pub fn is_simple_real(&self, i: usize) -> bool {
        self.arg(i).contains(ArgAssumptions::SIMPLE_REAL)
    }

    pub fn is_non_reflective(&self, i: usize) -> bool {
        self.arg(i).contains(ArgAssumptions::NON_REFLECTIVE)
    }

    /// Total number of assumption bits set; dispatch prefers the version with
    /// the most.
    pub fn strength(&self) -> u32 {
        self.flags.bits().count_ones()
            + self.args.iter().map(|a| a.bits().count_ones()).sum::<u32>()
            + u32::from(self.missing != 0)
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<")?;
        let mut sep = "";
        for (name, flag) in [
            ("order", Assumptions::CORRECT_ORDER_OF_ARGUMENTS),
            ("!many", Assumptions::NOT_TOO_MANY_ARGUMENTS),
            ("!few", Assumptions::NOT_TOO_FEW_ARGUMENTS),
            ("!miss", Assumptions::NO_EXPLICITLY_MISSING_ARGS),
            ("match", Assumptions::STATICALLY_ARG_MATCHED),
            ("!refl", Assumptions::NO_REFLECTIVE_ARGUMENT),
        ] {
            if self.flags.contains(flag) {
                write!(f, "{}{}", sep, name)?;
                sep = " ";
            }
        }
        for (i, a) in self.args.iter().enumerate() {
            if !a.is_empty() {
                write!(f, "{}a{}:", sep, i)?;
                sep = " ";
                if a.contains(ArgAssumptions::EAGER) {
                    write!(f, "e")?;
                }
                if a.contains(ArgAssumptions::NOT_OBJ) {
                    write!(f, "o")?;
                }
                if a.contains(ArgAssumptions::SIMPLE_INT) {
                    write!(f, "i")?;
                }
                if a.contains(ArgAssumptions::SIMPLE_REAL) {
                    write!(f, "r")?;
                }
                if a.contains(ArgAssumptions::NON_REFLECTIVE) {
                    write!(f, "n")?;
                }
            }
        }
        if self.missing > 0 {
            write!(f, "{}miss:{}", sep, self.missing)?;
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_includes_reflexive() {
        let ctx = Context::minimal();
        assert!(ctx.includes(&ctx));
        assert!(ctx.includes(&Context::new()));
        assert!(!Context::new().includes(&ctx));
    }

    #[test]
    fn test_per_arg_flags() {
        let mut ctx = Context::minimal();
        ctx.set_eager(0);
        ctx.set_not_obj(0);
        ctx.set_eager(2);

        assert!(ctx.is_eager(0));
        assert!(ctx.is_not_obj(0));
        assert!(!ctx.is_eager(1));
        assert!(ctx.is_eager(2));
        // Positions past the tracked window report nothing
        assert!(!ctx.is_eager(MAX_CONTEXT_ARGS + 1));

        assert!(ctx.includes(&Context::minimal()));
        assert!(!Context::minimal().includes(&ctx));
    }

    #[test]
    fn test_union() {
        let mut a = Context::minimal();
        a.set_eager(0);
        let mut b = Context::new();
        b.set_not_obj(0);
        b.flags |= Assumptions::NO_REFLECTIVE_ARGUMENT;

        let u = a.union(&b);
        assert!(u.includes(&a));
        assert!(u.includes(&b));
        assert!(u.is_eager(0) && u.is_not_obj(0));
    }

    #[test]
    fn test_strength_ordering() {
        let weak = Context::minimal();
        let mut strong = weak;
        strong.set_eager(0);
        strong.set_eager(1);
        assert!(strong.strength() > weak.strength());
    }
}
