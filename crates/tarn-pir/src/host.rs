//! Host callbacks.
//!
//! Constant folding asks the host to evaluate pure operations over interface
//! values. `NativeHost` implements the host's arithmetic semantics directly
//! on the mirror values: NA propagates, integer overflow produces integer
//! NA, division leaves the integer domain.

use tarn_bytecode::value::{BcValue, Builtin, SexpKind, INT_NA};

use crate::ir::tag::Tag;

pub trait Host {
    /// Evaluate a pure binary operation; None when not evaluable statically.
    fn eval_binop(&self, op: &Tag, lhs: &BcValue, rhs: &BcValue) -> Option<BcValue>;

    /// Evaluate a pure unary operation.
    fn eval_unop(&self, op: &Tag, v: &BcValue) -> Option<BcValue>;

    /// Evaluate a pure builtin.
    fn eval_builtin(&self, builtin: Builtin, args: &[&BcValue]) -> Option<BcValue>;
}

/// Host semantics over the structural value mirror.
#[derive(Debug, Default)]
pub struct NativeHost;

impl NativeHost {
    fn arith_int(op: &Tag, l: i32, r: i32) -> Option<BcValue> {
        let out = match op {
            Tag::Add => l.checked_add(r),
            Tag::Sub => l.checked_sub(r),
            Tag::Mul => l.checked_mul(r),
            Tag::IDiv => {
                if r == 0 {
                    return Some(BcValue::Int(INT_NA));
                }
                Some(l.div_euclid(r))
            }
            Tag::Mod => {
                if r == 0 {
                    return Some(BcValue::Int(INT_NA));
                }
                Some(l.rem_euclid(r))
            }
            // Division and power leave the integer domain
            Tag::Div => return Some(BcValue::Real(l as f64 / r as f64)),
            Tag::Pow => return Some(BcValue::Real((l as f64).powf(r as f64))),
            _ => return None,
        };
        // Overflow produces integer NA, with a warning at run time
        Some(BcValue::Int(out.unwrap_or(INT_NA)))
    }

    fn arith_real(op: &Tag, l: f64, r: f64) -> Option<BcValue> {
        let out = match op {
            Tag::Add => l + r,
            Tag::Sub => l - r,
            Tag::Mul => l * r,
            Tag::Div => l / r,
            Tag::IDiv => (l / r).floor(),
            Tag::Mod => l - (l / r).floor() * r,
            Tag::Pow => l.powf(r),
            _ => return None,
        };
        Some(BcValue::Real(out))
    }

    fn compare(op: &Tag, l: &BcValue, r: &BcValue) -> Option<BcValue> {
        if l.any_na() || r.any_na() {
            return Some(BcValue::NA);
        }
        let ord = match (l.as_real(), r.as_real()) {
            (Some(a), Some(b)) => a.partial_cmp(&b)?,
            _ => match (l, r) {
                (BcValue::Str(a), BcValue::Str(b)) => a.cmp(b),
                _ => return None,
            },
        };
        let out = match op {
            Tag::Lt => ord.is_lt(),
            Tag::Lte => ord.is_le(),
            Tag::Gt => ord.is_gt(),
            Tag::Gte => ord.is_ge(),
            Tag::Eq => ord.is_eq(),
            Tag::Neq => ord.is_ne(),
            _ => return None,
        };
        Some(BcValue::Lgl(Some(out)))
    }

    fn colon(l: &BcValue, r: &BcValue) -> Option<BcValue> {
        let (a, b) = (l.as_int()?, r.as_int()?);
        let len = (b - a).unsigned_abs() as usize + 1;
        // Only fold small literal ranges; bigger ones stay a runtime seq
        if len > 32 {
            return None;
        }
        let seq: Vec<i32> = if a <= b { (a..=b).collect() } else { (b..=a).rev().collect() };
        Some(BcValue::IntVec(seq))
    }
}

impl Host for NativeHost {
    fn eval_binop(&self, op: &Tag, lhs: &BcValue, rhs: &BcValue) -> Option<BcValue> {
        if matches!(op, Tag::Colon) {
            return Self::colon(lhs, rhs);
        }
        if op.is_comparison() {
            return Self::compare(op, lhs, rhs);
        }
        if matches!(op, Tag::LAnd | Tag::LOr) {
            let (a, b) = (lhs.as_test(), rhs.as_test());
            return Some(match (op, a, b) {
                (Tag::LAnd, Some(false), _) | (Tag::LAnd, _, Some(false)) => BcValue::FALSE,
                (Tag::LOr, Some(true), _) | (Tag::LOr, _, Some(true)) => BcValue::TRUE,
                (Tag::LAnd, Some(true), Some(true)) => BcValue::TRUE,
                (Tag::LOr, Some(false), Some(false)) => BcValue::FALSE,
                _ => BcValue::NA,
            });
        }
        if lhs.any_na() || rhs.any_na() {
            return match (lhs.sexp_kind(), rhs.sexp_kind()) {
                (SexpKind::Real, _) | (_, SexpKind::Real) => Some(BcValue::Real(f64::NAN)),
                _ => Some(BcValue::Int(INT_NA)),
            };
        }
        match (lhs, rhs) {
            (BcValue::Int(a), BcValue::Int(b)) => Self::arith_int(op, *a, *b),
            _ => Self::arith_real(op, lhs.as_real()?, rhs.as_real()?),
        }
    }

    fn eval_unop(&self, op: &Tag, v: &BcValue) -> Option<BcValue> {
        match op {
            Tag::Not => match v.as_test() {
                Some(b) => Some(BcValue::Lgl(Some(!b))),
                None => Some(BcValue::NA),
            },
            Tag::Plus => match v {
                BcValue::Int(_) | BcValue::Real(_) => Some(v.clone()),
                BcValue::Lgl(Some(b)) => Some(BcValue::Int(*b as i32)),
                _ => None,
            },
            Tag::Minus => match v {
                BcValue::Int(i) if *i != INT_NA => Some(BcValue::Int(-i)),
                BcValue::Int(_) => Some(BcValue::Int(INT_NA)),
                BcValue::Real(r) => Some(BcValue::Real(-r)),
                _ => None,
            },
            _ => None,
        }
    }

    fn eval_builtin(&self, builtin: Builtin, args: &[&BcValue]) -> Option<BcValue> {
        use Builtin::*;
        match (builtin, args) {
            (Length, [v]) => Some(BcValue::Int(v.length() as i32)),
            (IsFunction, [v]) => {
                Some(BcValue::Lgl(Some(matches!(v, BcValue::Closure(_) | BcValue::Builtin(_)))))
            }
            (IsCharacter, [v]) => Some(BcValue::Lgl(Some(matches!(v, BcValue::Str(_))))),
            (IsDouble, [v]) => {
                Some(BcValue::Lgl(Some(matches!(v, BcValue::Real(_) | BcValue::RealVec(_)))))
            }
            (IsInteger, [v]) => {
                Some(BcValue::Lgl(Some(matches!(v, BcValue::Int(_) | BcValue::IntVec(_)))))
            }
            (IsLogical, [v]) => Some(BcValue::Lgl(Some(matches!(v, BcValue::Lgl(_))))),
            (IsObject, [v]) => Some(BcValue::Lgl(Some(v.is_object()))),
            (IsNa, [v]) if v.is_scalar() => Some(BcValue::Lgl(Some(v.any_na()))),
            (AnyNa, [v]) => Some(BcValue::Lgl(Some(v.any_na()))),
            (AsLogical, [v]) => Some(BcValue::Lgl(v.as_test())),
            (AsInteger, [v]) => match v {
                BcValue::Int(_) => Some((*v).clone()),
                BcValue::Real(r) if !r.is_nan() => Some(BcValue::Int(*r as i32)),
                BcValue::Lgl(Some(b)) => Some(BcValue::Int(*b as i32)),
                BcValue::Lgl(None) => Some(BcValue::Int(INT_NA)),
                _ => None,
            },
            (AsCharacter, [BcValue::Str(s)]) => Some(BcValue::Str(s.clone())),
            (BitwAnd, [a, b]) => Some(BcValue::Int(a.as_int()? & b.as_int()?)),
            (BitwOr, [a, b]) => Some(BcValue::Int(a.as_int()? | b.as_int()?)),
            (BitwXor, [a, b]) => Some(BcValue::Int(a.as_int()? ^ b.as_int()?)),
            (Min, [a, b]) => Some(if a.as_real()? <= b.as_real()? { (*a).clone() } else { (*b).clone() }),
            (Max, [a, b]) => Some(if a.as_real()? >= b.as_real()? { (*a).clone() } else { (*b).clone() }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arith() {
        let h = NativeHost;
        assert_eq!(h.eval_binop(&Tag::Add, &BcValue::Int(3), &BcValue::Int(4)), Some(BcValue::Int(7)));
        // Overflow goes to NA
        assert_eq!(
            h.eval_binop(&Tag::Add, &BcValue::Int(i32::MAX), &BcValue::Int(1)),
            Some(BcValue::Int(INT_NA))
        );
        // Division leaves the integer domain
        assert_eq!(h.eval_binop(&Tag::Div, &BcValue::Int(7), &BcValue::Int(2)), Some(BcValue::Real(3.5)));
    }

    #[test]
    fn test_na_propagation() {
        let h = NativeHost;
        assert_eq!(
            h.eval_binop(&Tag::Add, &BcValue::Int(INT_NA), &BcValue::Int(1)),
            Some(BcValue::Int(INT_NA))
        );
        assert_eq!(h.eval_binop(&Tag::Lt, &BcValue::NA, &BcValue::Int(1)), Some(BcValue::NA));
        // Short-circuit wins over NA
        assert_eq!(h.eval_binop(&Tag::LAnd, &BcValue::NA, &BcValue::FALSE), Some(BcValue::FALSE));
        assert_eq!(h.eval_binop(&Tag::LOr, &BcValue::TRUE, &BcValue::NA), Some(BcValue::TRUE));
    }

    #[test]
    fn test_colon_folds_small_ranges() {
        let h = NativeHost;
        assert_eq!(
            h.eval_binop(&Tag::Colon, &BcValue::Int(1), &BcValue::Int(3)),
            Some(BcValue::IntVec(vec![1, 2, 3]))
        );
        assert_eq!(
            h.eval_binop(&Tag::Colon, &BcValue::Int(3), &BcValue::Int(1)),
            Some(BcValue::IntVec(vec![3, 2, 1]))
        );
        assert_eq!(h.eval_binop(&Tag::Colon, &BcValue::Int(1), &BcValue::Int(1000)), None);
    }

    #[test]
    fn test_builtins() {
        let h = NativeHost;
        assert_eq!(h.eval_builtin(Builtin::Length, &[&BcValue::IntVec(vec![1, 2, 3])]), Some(BcValue::Int(3)));
        assert_eq!(h.eval_builtin(Builtin::IsInteger, &[&BcValue::Int(1)]), Some(BcValue::TRUE));
        assert_eq!(h.eval_builtin(Builtin::IsNa, &[&BcValue::NA]), Some(BcValue::TRUE));
        assert_eq!(h.eval_builtin(Builtin::Max, &[&BcValue::Int(2), &BcValue::Int(5)]), Some(BcValue::Int(5)));
    }
}
