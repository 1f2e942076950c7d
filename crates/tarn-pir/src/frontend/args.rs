//! Argument matching against a callee's formals.
//!
//! Implements the host's matching order: exact name matches claim their
//! formal slot first, then unnamed arguments fill the remaining slots left
//! to right. Unfilled slots become the missing marker. When the callee has a
//! `...` formal, surplus positional arguments are collected into a dots
//! list; named surplus arguments keep the call dynamic.

use tarn_bytecode::module::Formals;
use tarn_bytecode::symbols::Symbol;

use crate::ir::value::Value;

/// One matched formal slot.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchedArg {
    Val(Value),
    Missing,
    /// Values collected under the `...` formal
    Dots(Vec<Value>),
}

/// Match call arguments to formal slots. Returns None when the call cannot
/// be statically matched (surplus names, over-application).
pub fn match_call_args(
    formals: &Formals,
    args: &[Value],
    names: &[Option<Symbol>],
) -> Option<Vec<MatchedArg>> {
    debug_assert_eq!(args.len(), names.len());
    let nformals = formals.num_args();
    let dots_pos = formals.position(Symbol::DOTS);

    if dots_pos.is_some() && names.iter().any(|n| n.is_some()) {
        // Named arguments into a dots-taking callee stay dynamic
        return None;
    }

    let mut slots: Vec<Option<MatchedArg>> = vec![None; nformals];
    let mut claimed = vec![false; args.len()];

    // Exact name matches first
    for (i, name) in names.iter().enumerate() {
        let Some(name) = name else { continue };
        let pos = formals.position(*name)?;
        if slots[pos].is_some() {
            return None;
        }
        slots[pos] = Some(MatchedArg::Val(args[i]));
        claimed[i] = true;
    }

    // Positional fill, skipping the dots slot
    let mut next = 0;
    for (i, arg) in args.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        while next < nformals && (slots[next].is_some() || Some(next) == dots_pos) {
            next += 1;
        }
        match (next < nformals, dots_pos) {
            (true, _) => {
                slots[next] = Some(MatchedArg::Val(*arg));
                claimed[i] = true;
            }
            (false, Some(d)) => {
                // Surplus goes into dots
                match &mut slots[d] {
                    Some(MatchedArg::Dots(list)) => list.push(*arg),
                    slot @ None => *slot = Some(MatchedArg::Dots(vec![*arg])),
                    _ => return None,
                }
                claimed[i] = true;
            }
            (false, None) => return None,
        }
    }

    Some(
        slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| match s {
                Some(m) => m,
                None if Some(i) == dots_pos => MatchedArg::Dots(Vec::new()),
                None => MatchedArg::Missing,
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formals(names: &[u32]) -> Formals {
        Formals::new(names.iter().map(|n| Symbol(*n)).collect())
    }

    #[test]
    fn test_positional() {
        let f = formals(&[10, 11]);
        let out = match_call_args(&f, &[Value::True, Value::False], &[None, None]).unwrap();
        assert_eq!(out, vec![MatchedArg::Val(Value::True), MatchedArg::Val(Value::False)]);
    }

    #[test]
    fn test_named_reorders() {
        let f = formals(&[10, 11]);
        let out =
            match_call_args(&f, &[Value::True, Value::False], &[Some(Symbol(11)), None]).unwrap();
        assert_eq!(out, vec![MatchedArg::Val(Value::False), MatchedArg::Val(Value::True)]);
    }

    #[test]
    fn test_missing_fills() {
        let f = formals(&[10, 11, 12]);
        let out = match_call_args(&f, &[Value::True], &[None]).unwrap();
        assert_eq!(
            out,
            vec![MatchedArg::Val(Value::True), MatchedArg::Missing, MatchedArg::Missing]
        );
    }

    #[test]
    fn test_over_application_fails() {
        let f = formals(&[10]);
        assert!(match_call_args(&f, &[Value::True, Value::False], &[None, None]).is_none());
    }

    #[test]
    fn test_unknown_name_fails() {
        let f = formals(&[10]);
        assert!(match_call_args(&f, &[Value::True], &[Some(Symbol(99))]).is_none());
    }

    #[test]
    fn test_dots_collects_surplus() {
        // function(a, ...)
        let f = Formals::new(vec![Symbol(10), Symbol::DOTS]);
        let out =
            match_call_args(&f, &[Value::True, Value::False, Value::Nil], &[None, None, None])
                .unwrap();
        assert_eq!(
            out,
            vec![
                MatchedArg::Val(Value::True),
                MatchedArg::Dots(vec![Value::False, Value::Nil])
            ]
        );
    }

    #[test]
    fn test_dots_with_names_stays_dynamic() {
        let f = Formals::new(vec![Symbol(10), Symbol::DOTS]);
        assert!(match_call_args(&f, &[Value::True], &[Some(Symbol(10))]).is_none());
    }

    #[test]
    fn test_duplicate_name_fails() {
        let f = formals(&[10, 11]);
        assert!(match_call_args(
            &f,
            &[Value::True, Value::False],
            &[Some(Symbol(10)), Some(Symbol(10))]
        )
        .is_none());
    }
}
