//! The PIR type lattice.
//!
//! A `PirType` is either a union of R value kinds or a union of native
//! (compiler-internal) kinds, plus a flag set of modifiers. Flags are all
//! "maybe" facts: a type without a flag is strictly more precise than the
//! same type with it. The subtype check is therefore uniform: `a` is a
//! subtype of `b` iff `a`'s kinds and flags are both subsets of `b`'s.
//!
//! As an example, an R integer that may still be a lazy promise has kinds
//! `INT` and flags `LAZY | PROMISE_WRAPPED | ...`; a machine truth value has
//! the native kind `TEST` and no flags.

use bitflags::bitflags;
use tarn_bytecode::context::{ArgAssumptions, Context};
use tarn_bytecode::feedback::ObservedType;
use tarn_bytecode::value::SexpKind;

bitflags! {
    /// Union of R value kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RTypeSet: u32 {
        const NIL     = 1 << 0;
        const CONS    = 1 << 1;
        const SYM     = 1 << 2;
        const CHR     = 1 << 3;
        const LGL     = 1 << 4;
        const INT     = 1 << 5;
        const REAL    = 1 << 6;
        const CPLX    = 1 << 7;
        const STR     = 1 << 8;
        const VEC     = 1 << 9;
        const RAW     = 1 << 10;
        const CLO     = 1 << 11;
        const PROM    = 1 << 12;
        const MISSING = 1 << 13;
        const UNBOUND = 1 << 14;
        const CODE    = 1 << 15;
        const ENV     = 1 << 16;
        const AST     = 1 << 17;
    }
}

bitflags! {
    /// Union of native kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NativeSet: u8 {
        const TEST        = 1 << 0;
        const CHECKPOINT  = 1 << 1;
        const FRAME_STATE = 1 << 2;
        const CONTEXT     = 1 << 3;
    }
}

bitflags! {
    /// Modifier flags. All are "maybe" facts; absence is the stricter state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u8 {
        /// May be an unevaluated promise
        const LAZY             = 1 << 0;
        /// May be wrapped in an (already evaluated) promise
        const PROMISE_WRAPPED  = 1 << 1;
        /// May have length != 1
        const MAYBE_NOT_SCALAR = 1 << 2;
        /// May carry a class attribute
        const MAYBE_OBJECT     = 1 << 3;
        /// May contain NA
        const MAYBE_NA         = 1 << 4;
        /// May carry attributes other than class
        const MAYBE_ATTRIBS    = 1 << 5;
    }
}

/// The kind union, R or native.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    R(RTypeSet),
    Native(NativeSet),
}

/// A PIR type: kind union plus modifier flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PirType {
    pub base: BaseType,
    pub flags: TypeFlags,
}

impl PirType {
    const DEFAULT_R_FLAGS: TypeFlags = TypeFlags::MAYBE_NOT_SCALAR
        .union(TypeFlags::MAYBE_NA)
        .union(TypeFlags::MAYBE_ATTRIBS);

    // ===== Factories =====

    pub const fn r(kinds: RTypeSet) -> PirType {
        PirType { base: BaseType::R(kinds), flags: Self::DEFAULT_R_FLAGS }
    }

    pub const fn native(kinds: NativeSet) -> PirType {
        PirType { base: BaseType::Native(kinds), flags: TypeFlags::empty() }
    }

    /// Any forced, unwrapped R value (including missing/unbound markers).
    pub const fn val() -> PirType {
        PirType {
            base: BaseType::R(RTypeSet::all()),
            flags: Self::DEFAULT_R_FLAGS.union(TypeFlags::MAYBE_OBJECT),
        }
    }

    /// `val`, possibly wrapped in an evaluated promise.
    pub fn promise_wrapped_val() -> PirType {
        PirType::val().or_promise_wrapped()
    }

    /// `val`, possibly a lazy promise. The most permissive value type.
    pub fn val_or_lazy() -> PirType {
        PirType::val().or_lazy()
    }

    /// Alias for the top of the value lattice.
    pub fn any() -> PirType {
        PirType::val_or_lazy()
    }

    pub const fn num() -> PirType {
        PirType::r(RTypeSet::LGL.union(RTypeSet::INT).union(RTypeSet::REAL).union(RTypeSet::CPLX))
    }

    pub const fn list() -> PirType {
        PirType::r(RTypeSet::CONS.union(RTypeSet::NIL))
    }

    pub const fn closure() -> PirType {
        PirType::r(RTypeSet::CLO)
    }

    pub const fn env() -> PirType {
        PirType::r(RTypeSet::ENV)
    }

    pub const fn lgl() -> PirType {
        PirType::r(RTypeSet::LGL)
    }

    pub const fn int() -> PirType {
        PirType::r(RTypeSet::INT)
    }

    pub const fn real() -> PirType {
        PirType::r(RTypeSet::REAL)
    }

    pub const fn str() -> PirType {
        PirType::r(RTypeSet::STR)
    }

    pub const fn missing() -> PirType {
        PirType { base: BaseType::R(RTypeSet::MISSING), flags: TypeFlags::empty() }
    }

    pub const fn test() -> PirType {
        PirType::native(NativeSet::TEST)
    }

    pub const fn checkpoint() -> PirType {
        PirType::native(NativeSet::CHECKPOINT)
    }

    pub const fn frame_state() -> PirType {
        PirType::native(NativeSet::FRAME_STATE)
    }

    /// The empty native union: instructions that produce no value.
    pub const fn voyd() -> PirType {
        PirType::native(NativeSet::empty())
    }

    /// The empty R union: unreachable.
    pub const fn bottom() -> PirType {
        PirType { base: BaseType::R(RTypeSet::empty()), flags: TypeFlags::empty() }
    }

    /// A logical scalar that is neither NA nor an object (e.g. `TRUE`).
    pub fn simple_lgl() -> PirType {
        PirType::lgl().scalar().not_object().not_na().no_attribs()
    }

    /// Any scalar of a simple numeric kind.
    pub fn any_simple_scalar() -> PirType {
        PirType::num().scalar().not_object().no_attribs()
    }

    // ===== Predicates =====

    pub fn is_r(&self) -> bool {
        matches!(self.base, BaseType::R(_))
    }

    pub fn is_void(&self) -> bool {
        self.base == BaseType::Native(NativeSet::empty())
    }

    pub fn is_bottom(&self) -> bool {
        self.base == BaseType::R(RTypeSet::empty())
    }

    pub fn maybe(&self, kind: RTypeSet) -> bool {
        match self.base {
            BaseType::R(k) => k.intersects(kind),
            BaseType::Native(_) => false,
        }
    }

    pub fn maybe_lazy(&self) -> bool {
        self.flags.contains(TypeFlags::LAZY)
    }

    pub fn maybe_promise_wrapped(&self) -> bool {
        self.flags.intersects(TypeFlags::PROMISE_WRAPPED | TypeFlags::LAZY)
    }

    pub fn maybe_obj(&self) -> bool {
        self.flags.contains(TypeFlags::MAYBE_OBJECT)
    }

    pub fn maybe_na(&self) -> bool {
        self.flags.contains(TypeFlags::MAYBE_NA)
    }

    pub fn maybe_missing(&self) -> bool {
        self.maybe(RTypeSet::MISSING)
    }

    pub fn is_scalar(&self) -> bool {
        self.is_r() && !self.flags.contains(TypeFlags::MAYBE_NOT_SCALAR)
    }

    /// Subtype check: `self.is_a(other)` means every value of `self` is also
    /// a value of `other`.
    pub fn is_a(&self, other: &PirType) -> bool {
        other.is_super(self)
    }

    pub fn is_super(&self, other: &PirType) -> bool {
        match (self.base, other.base) {
            (BaseType::R(a), BaseType::R(b)) => {
                a.contains(b) && self.flags.contains(other.flags)
            }
            (BaseType::Native(a), BaseType::Native(b)) => a.contains(b),
            _ => false,
        }
    }

    // ===== Lattice operations =====

    /// Join. Both sides must be in the same half of the lattice.
    pub fn union(&self, other: &PirType) -> PirType {
        let base = match (self.base, other.base) {
            (BaseType::R(a), BaseType::R(b)) => BaseType::R(a | b),
            (BaseType::Native(a), BaseType::Native(b)) => BaseType::Native(a | b),
            // A merge across the halves only happens on broken input; give
            // back the most permissive value type.
            _ => return PirType::any(),
        };
        PirType { base, flags: self.flags | other.flags }
    }

    /// Meet.
    pub fn intersect(&self, other: &PirType) -> PirType {
        let base = match (self.base, other.base) {
            (BaseType::R(a), BaseType::R(b)) => BaseType::R(a & b),
            (BaseType::Native(a), BaseType::Native(b)) => BaseType::Native(a & b),
            _ => return PirType::bottom(),
        };
        PirType { base, flags: self.flags & other.flags }
    }

    /// Widen in place; returns whether anything changed.
    pub fn merge(&mut self, other: &PirType) -> bool {
        let joined = self.union(other);
        let changed = joined != *self;
        *self = joined;
        changed
    }

    // ===== Refinements =====

    fn without(&self, flags: TypeFlags) -> PirType {
        PirType { base: self.base, flags: self.flags - flags }
    }

    fn with(&self, flags: TypeFlags) -> PirType {
        PirType { base: self.base, flags: self.flags | flags }
    }

    pub fn not_object(&self) -> PirType {
        self.without(TypeFlags::MAYBE_OBJECT)
    }

    pub fn not_na(&self) -> PirType {
        self.without(TypeFlags::MAYBE_NA)
    }

    pub fn no_attribs(&self) -> PirType {
        self.without(TypeFlags::MAYBE_ATTRIBS)
    }

    pub fn not_missing(&self) -> PirType {
        match self.base {
            BaseType::R(k) => PirType { base: BaseType::R(k - RTypeSet::MISSING), flags: self.flags },
            BaseType::Native(_) => *self,
        }
    }

    pub fn scalar(&self) -> PirType {
        self.without(TypeFlags::MAYBE_NOT_SCALAR)
    }

    /// The type after forcing: no longer lazy or wrapped, and no longer a
    /// bare promise.
    pub fn forced(&self) -> PirType {
        let t = self.without(TypeFlags::LAZY | TypeFlags::PROMISE_WRAPPED);
        match t.base {
            BaseType::R(k) => PirType { base: BaseType::R(k - RTypeSet::PROM), flags: t.flags },
            BaseType::Native(_) => t,
        }
    }

    pub fn or_lazy(&self) -> PirType {
        self.with(TypeFlags::LAZY | TypeFlags::PROMISE_WRAPPED)
    }

    pub fn or_promise_wrapped(&self) -> PirType {
        self.with(TypeFlags::PROMISE_WRAPPED)
    }

    pub fn or_object(&self) -> PirType {
        self.with(TypeFlags::MAYBE_OBJECT | TypeFlags::MAYBE_ATTRIBS)
    }

    pub fn or_na(&self) -> PirType {
        self.with(TypeFlags::MAYBE_NA)
    }

    pub fn or_not_scalar(&self) -> PirType {
        self.with(TypeFlags::MAYBE_NOT_SCALAR)
    }

    pub fn or_missing(&self) -> PirType {
        match self.base {
            BaseType::R(k) => PirType { base: BaseType::R(k | RTypeSet::MISSING), flags: self.flags },
            BaseType::Native(_) => *self,
        }
    }

    pub fn base_only(&self) -> PirType {
        PirType { base: self.base, flags: Self::DEFAULT_R_FLAGS | TypeFlags::MAYBE_OBJECT }
    }

    // ===== Feedback ingestion =====

    /// Widen by one observed-type feedback slot.
    pub fn merge_observed(&mut self, observed: &ObservedType) -> bool {
        if observed.overflow {
            return self.merge(&PirType::any());
        }
        let mut changed = false;
        for rec in &observed.records {
            let mut t = PirType::from_sexp(rec.kind);
            if rec.scalar {
                t = t.scalar();
            }
            if !rec.object {
                t = t.not_object();
            }
            if !rec.attribs {
                t = t.no_attribs();
            }
            if !rec.maybe_na {
                t = t.not_na();
            }
            changed |= self.merge(&t);
        }
        changed
    }

    /// The R type of a host value kind.
    pub fn from_sexp(kind: SexpKind) -> PirType {
        let kinds = match kind {
            SexpKind::Nil => RTypeSet::NIL,
            SexpKind::Cons => RTypeSet::CONS,
            SexpKind::Sym => RTypeSet::SYM,
            SexpKind::Char => RTypeSet::CHR,
            SexpKind::Lgl => RTypeSet::LGL,
            SexpKind::Int => RTypeSet::INT,
            SexpKind::Real => RTypeSet::REAL,
            SexpKind::Cplx => RTypeSet::CPLX,
            SexpKind::Str => RTypeSet::STR,
            SexpKind::Vec => RTypeSet::VEC,
            SexpKind::Raw => RTypeSet::RAW,
            SexpKind::Closure => RTypeSet::CLO,
            SexpKind::Promise => RTypeSet::PROM,
            SexpKind::Missing => RTypeSet::MISSING,
            SexpKind::Unbound => RTypeSet::UNBOUND,
            SexpKind::Code => RTypeSet::CODE,
            SexpKind::Env => RTypeSet::ENV,
            SexpKind::Ast => RTypeSet::AST,
        };
        PirType::r(kinds)
    }

    /// Narrow an argument's type by the caller's context assumptions.
    pub fn arg_from_context(ctx: &Context, idx: usize) -> PirType {
        let mut t = PirType::any();
        let a = ctx.arg(idx);
        if a.contains(ArgAssumptions::EAGER) {
            t = t.without(TypeFlags::LAZY);
        }
        if a.contains(ArgAssumptions::NOT_OBJ) {
            t = t.not_object();
        }
        if a.contains(ArgAssumptions::SIMPLE_INT) {
            t = t.intersect(&PirType::int().or_promise_wrapped()).scalar().no_attribs();
        }
        if a.contains(ArgAssumptions::SIMPLE_REAL) {
            t = t.intersect(&PirType::real().or_promise_wrapped()).scalar().no_attribs();
        }
        t
    }
}

impl Default for PirType {
    fn default() -> Self {
        PirType::bottom()
    }
}

impl std::fmt::Display for PirType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.base {
            BaseType::Native(n) => {
                if n.is_empty() {
                    return write!(f, "void");
                }
                let mut sep = "";
                for (name, kind) in [
                    ("t", NativeSet::TEST),
                    ("cp", NativeSet::CHECKPOINT),
                    ("fs", NativeSet::FRAME_STATE),
                    ("ct", NativeSet::CONTEXT),
                ] {
                    if n.contains(kind) {
                        write!(f, "{}{}", sep, name)?;
                        sep = "|";
                    }
                }
                Ok(())
            }
            BaseType::R(kinds) => {
                if kinds.is_empty() {
                    write!(f, "bot")?;
                } else if kinds == RTypeSet::all() {
                    write!(f, "val")?;
                } else {
                    let names = [
                        (RTypeSet::NIL, "nil"),
                        (RTypeSet::CONS, "cons"),
                        (RTypeSet::SYM, "sym"),
                        (RTypeSet::CHR, "char"),
                        (RTypeSet::LGL, "lgl"),
                        (RTypeSet::INT, "int"),
                        (RTypeSet::REAL, "real"),
                        (RTypeSet::CPLX, "complex"),
                        (RTypeSet::STR, "str"),
                        (RTypeSet::VEC, "vec"),
                        (RTypeSet::RAW, "raw"),
                        (RTypeSet::CLO, "cls"),
                        (RTypeSet::PROM, "prom"),
                        (RTypeSet::MISSING, "miss"),
                        (RTypeSet::UNBOUND, "_"),
                        (RTypeSet::CODE, "code"),
                        (RTypeSet::ENV, "env"),
                        (RTypeSet::AST, "ast"),
                    ];
                    let count = kinds.bits().count_ones();
                    if count > 1 {
                        write!(f, "(")?;
                    }
                    let mut sep = "";
                    for (kind, name) in names {
                        if kinds.contains(kind) {
                            write!(f, "{}{}", sep, name)?;
                            sep = "|";
                        }
                    }
                    if count > 1 {
                        write!(f, ")")?;
                    }
                }
                if self.is_scalar() {
                    write!(f, "$")?;
                }
                if self.maybe_lazy() {
                    write!(f, "^")?;
                } else if self.maybe_promise_wrapped() {
                    write!(f, "~")?;
                }
                if !self.maybe_obj() {
                    write!(f, "'")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_bytecode::feedback::{ObservedType, TypeRecord};
    use tarn_bytecode::value::BcValue;

    #[test]
    fn test_subtyping_kinds() {
        assert!(PirType::int().is_a(&PirType::num()));
        assert!(PirType::num().is_a(&PirType::val()));
        assert!(!PirType::num().is_a(&PirType::int()));
        assert!(PirType::bottom().is_a(&PirType::int()));
        assert!(!PirType::test().is_a(&PirType::val()));
    }

    #[test]
    fn test_subtyping_flags() {
        // scalar is stricter than maybe-not-scalar
        assert!(PirType::int().scalar().is_a(&PirType::int()));
        assert!(!PirType::int().is_a(&PirType::int().scalar()));
        // !lazy is stricter than lazy
        assert!(PirType::val().is_a(&PirType::val_or_lazy()));
        assert!(!PirType::val_or_lazy().is_a(&PirType::val()));
        // not-object is stricter
        assert!(PirType::int().not_object().is_a(&PirType::int()));
    }

    #[test]
    fn test_union_widens_monotonically() {
        let mut t = PirType::int().scalar().not_object();
        let same = t;
        assert!(!t.merge(&same));
        assert!(t.merge(&PirType::real()));
        assert!(t.maybe(RTypeSet::REAL));
        // union dropped the scalar guarantee since real() may not be scalar
        assert!(!t.is_scalar());
        assert!(t.is_a(&PirType::num()));
    }

    #[test]
    fn test_forced_drops_wrapping() {
        let t = PirType::int().or_lazy();
        assert!(t.maybe_lazy());
        let forced = t.forced();
        assert!(!forced.maybe_lazy());
        assert!(!forced.maybe_promise_wrapped());
        assert!(forced.is_a(&PirType::int()));
    }

    #[test]
    fn test_void_and_bottom() {
        assert!(PirType::voyd().is_void());
        assert!(PirType::bottom().is_bottom());
        assert!(!PirType::val().is_bottom());
    }

    #[test]
    fn test_merge_observed_scalar_int() {
        let mut t = PirType::bottom();
        let mut obs = ObservedType::default();
        obs.record(TypeRecord::of(&BcValue::Int(1)));
        assert!(t.merge_observed(&obs));
        assert!(t.is_a(&PirType::int().scalar().not_object()));
        assert!(!t.maybe_na());

        let mut overflowed = ObservedType::default();
        overflowed.overflow = true;
        t.merge_observed(&overflowed);
        assert_eq!(t, PirType::any());
    }

    #[test]
    fn test_arg_from_context() {
        let mut ctx = Context::minimal();
        ctx.set_eager(0);
        ctx.set_not_obj(0);
        let t0 = PirType::arg_from_context(&ctx, 0);
        assert!(!t0.maybe_lazy());
        assert!(!t0.maybe_obj());
        // untouched positions stay fully lazy
        let t1 = PirType::arg_from_context(&ctx, 1);
        assert!(t1.maybe_lazy());
    }

    #[test]
    fn test_display() {
        assert_eq!(PirType::val().to_string(), "val");
        assert_eq!(PirType::int().scalar().not_object().to_string(), "int$'");
        assert_eq!(PirType::voyd().to_string(), "void");
        assert_eq!(PirType::test().to_string(), "t");
    }
}
