//! Runtime feedback slots.
//!
//! The baseline interpreter records observations into slots referenced by the
//! `RecordTest`, `RecordType`, and `RecordCall` opcodes. The optimizer reads
//! them to speculate; it never writes them.

use serde::{Deserialize, Serialize};

use crate::module::FunId;
use crate::value::{BcValue, Builtin, SexpKind};

/// Cap on distinct records kept per slot before it overflows to "anything".
pub const MAX_FEEDBACK_RECORDS: usize = 3;

/// One feedback slot in a code object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedbackSlot {
    Test(ObservedTest),
    Type(ObservedType),
    Call(ObservedCall),
}

/// Branch outcome counts for one test site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObservedTest {
    pub taken: u32,
    pub not_taken: u32,
}

impl ObservedTest {
    pub fn record(&mut self, taken: bool) {
        if taken {
            self.taken = self.taken.saturating_add(1);
        } else {
            self.not_taken = self.not_taken.saturating_add(1);
        }
    }

    /// Some(branch) if only one side has ever executed.
    pub fn only_one_branch(&self) -> Option<bool> {
        match (self.taken, self.not_taken) {
            (0, 0) => None,
            (_, 0) => Some(true),
            (0, _) => Some(false),
            _ => None,
        }
    }
}

/// One observed value shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRecord {
    pub kind: SexpKind,
    pub scalar: bool,
    pub object: bool,
    pub attribs: bool,
    pub maybe_na: bool,
}

impl TypeRecord {
    pub fn of(value: &BcValue) -> TypeRecord {
        TypeRecord {
            kind: value.sexp_kind(),
            scalar: value.is_scalar(),
            object: value.is_object(),
            attribs: value.is_object(),
            maybe_na: value.any_na(),
        }
    }
}

/// Value shapes seen at one recording site.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservedType {
    pub records: Vec<TypeRecord>,
    pub overflow: bool,
}

impl ObservedType {
    pub fn record(&mut self, rec: TypeRecord) {
        if self.overflow || self.records.contains(&rec) {
            return;
        }
        if self.records.len() >= MAX_FEEDBACK_RECORDS {
            self.overflow = true;
            self.records.clear();
            return;
        }
        self.records.push(rec);
    }

    pub fn is_empty(&self) -> bool {
        !self.overflow && self.records.is_empty()
    }

    /// Whether any observed value was an object.
    pub fn maybe_object(&self) -> bool {
        self.overflow || self.records.iter().any(|r| r.object)
    }

    /// Whether every observation was a scalar of the given kind, no object,
    /// no NA.
    pub fn monomorphic_scalar(&self, kind: SexpKind) -> bool {
        !self.overflow
            && !self.records.is_empty()
            && self
                .records
                .iter()
                .all(|r| r.kind == kind && r.scalar && !r.object && !r.maybe_na)
    }
}

/// A callee observed at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedCallee {
    Closure(FunId),
    Builtin(Builtin),
}

/// Callees seen at one call site.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservedCall {
    pub callees: Vec<ObservedCallee>,
    pub overflow: bool,
}

impl ObservedCall {
    pub fn record(&mut self, callee: ObservedCallee) {
        if self.overflow || self.callees.contains(&callee) {
            return;
        }
        if self.callees.len() >= MAX_FEEDBACK_RECORDS {
            self.overflow = true;
            self.callees.clear();
            return;
        }
        self.callees.push(callee);
    }

    /// The unique callee, if the site is monomorphic.
    pub fn monomorphic(&self) -> Option<ObservedCallee> {
        if !self.overflow && self.callees.len() == 1 {
            Some(self.callees[0])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_test() {
        let mut t = ObservedTest::default();
        assert_eq!(t.only_one_branch(), None);
        t.record(true);
        t.record(true);
        assert_eq!(t.only_one_branch(), Some(true));
        t.record(false);
        assert_eq!(t.only_one_branch(), None);
    }

    #[test]
    fn test_observed_type_overflow() {
        let mut t = ObservedType::default();
        t.record(TypeRecord::of(&BcValue::Int(1)));
        t.record(TypeRecord::of(&BcValue::Int(2)));
        assert_eq!(t.records.len(), 1); // identical shape deduped
        assert!(t.monomorphic_scalar(SexpKind::Int));

        t.record(TypeRecord::of(&BcValue::Real(1.0)));
        t.record(TypeRecord::of(&BcValue::Str("x".into())));
        t.record(TypeRecord::of(&BcValue::Nil));
        assert!(t.overflow);
        assert!(t.maybe_object());
        assert!(!t.monomorphic_scalar(SexpKind::Int));
    }

    #[test]
    fn test_observed_call_monomorphic() {
        let mut c = ObservedCall::default();
        assert_eq!(c.monomorphic(), None);
        c.record(ObservedCallee::Builtin(Builtin::Length));
        c.record(ObservedCallee::Builtin(Builtin::Length));
        assert_eq!(c.monomorphic(), Some(ObservedCallee::Builtin(Builtin::Length)));
        c.record(ObservedCallee::Closure(FunId(0)));
        assert_eq!(c.monomorphic(), None);
    }
}
