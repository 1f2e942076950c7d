//! Queries over compiled code: purity, and the predicates the test suite
//! asserts on optimized versions.

use tarn_bytecode::symbols::Symbol;

use crate::ir::code::Code;
use crate::ir::effects::Effects;
use crate::ir::instr::Instr;
use crate::ir::tag::Tag;
use crate::ir::value::Value;
use crate::ir::version::ClosureVersion;
use crate::visitor::Visitor;

/// Whether a code unit has no observable effect besides possibly
/// deoptimizing. Such promises can be evaluated eagerly at their call site.
pub fn pure_except_deopt(code: &Code) -> bool {
    Visitor::check(code, |bb| {
        code.bb(bb).instrs.iter().all(|id| {
            let i = code.instr(*id);
            let residual = i.effects - Effects::TRIGGERS_DEOPT - Effects::DEPENDS_ON_ASSUME;
            residual.is_empty() && !matches!(i.tag, Tag::NonLocalReturn)
        })
    })
}

/// Properties `pir_check` can assert on an optimized version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckProperty {
    /// No environment is ever materialized
    NoEnv,
    /// No binding load remains
    NoLoad,
    /// No binding store remains
    NoStore,
    /// No calls except safe builtins remain
    NoExternalCalls,
}

fn each_instr(version: &ClosureVersion, mut f: impl FnMut(&Instr)) {
    let mut codes: Vec<&Code> = vec![&version.code];
    for id in version.promise_ids() {
        if let Some(p) = version.promise(id) {
            codes.push(&p.code);
        }
    }
    for code in codes {
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                f(code.instr(*id));
            }
        });
    }
}

/// No `MkEnv` remains and every environment edge is elided or static.
pub fn no_env(version: &ClosureVersion) -> bool {
    let mut ok = true;
    each_instr(version, |i| {
        if matches!(i.tag, Tag::MkEnv { .. }) {
            ok = false;
        }
    });
    ok
}

/// No load of the given binding remains (any binding if None).
pub fn no_load(version: &ClosureVersion, name: Option<Symbol>) -> bool {
    let mut ok = true;
    each_instr(version, |i| match i.tag {
        Tag::LdVar { name: n } | Tag::LdFun { name: n } | Tag::LdVarSuper { name: n } => {
            if name.is_none() || name == Some(n) {
                ok = false;
            }
        }
        _ => {}
    });
    ok
}

/// No store to the given binding remains (any binding if None).
pub fn no_store(version: &ClosureVersion, name: Option<Symbol>) -> bool {
    let mut ok = true;
    each_instr(version, |i| match i.tag {
        Tag::StVar { name: n } | Tag::StVarSuper { name: n } => {
            if name.is_none() || name == Some(n) {
                ok = false;
            }
        }
        _ => {}
    });
    ok
}

/// No generic or static calls remain; safe builtins are allowed.
pub fn no_external_calls(version: &ClosureVersion) -> bool {
    let mut ok = true;
    each_instr(version, |i| {
        if matches!(
            i.tag,
            Tag::Call { .. } | Tag::NamedCall { .. } | Tag::StaticCall { .. } | Tag::CallBuiltin { .. }
        ) {
            ok = false;
        }
    });
    ok
}

/// Whether any instruction with the given mnemonic remains.
pub fn has_instr(version: &ClosureVersion, name: &str) -> bool {
    let mut found = false;
    each_instr(version, |i| {
        if i.tag.name() == name {
            found = true;
        }
    });
    found
}

/// Every returned value's producing instruction satisfies the predicate.
pub fn returns(version: &ClosureVersion, pred: impl Fn(&Code, &Value) -> bool) -> bool {
    let code = &version.code;
    let mut ok = true;
    Visitor::run(code, |bb| {
        for id in &code.bb(bb).instrs {
            if matches!(code.instr(*id).tag, Tag::Return) && !pred(code, &code.instr(*id).args[0]) {
                ok = false;
            }
        }
    });
    ok
}

pub fn deopt_count(version: &ClosureVersion) -> usize {
    let mut n = 0;
    each_instr(version, |i| {
        if matches!(i.tag, Tag::Deopt | Tag::ScheduledDeopt { .. }) {
            n += 1;
        }
    });
    n
}

pub fn phi_count(version: &ClosureVersion) -> usize {
    let mut n = 0;
    each_instr(version, |i| {
        if i.is_phi() {
            n += 1;
        }
    });
    n
}

/// Evaluate one `pir_check` property.
pub fn check(version: &ClosureVersion, property: CheckProperty) -> bool {
    match property {
        CheckProperty::NoEnv => no_env(version),
        CheckProperty::NoLoad => no_load(version, None),
        CheckProperty::NoStore => no_store(version, None),
        CheckProperty::NoExternalCalls => no_external_calls(version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::FunId;

    #[test]
    fn test_pure_code() {
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let c = code.push(bb, Tag::LdConst { idx: tarn_bytecode::PoolIdx(0) }, vec![]);
        code.push(bb, Tag::Return, vec![Value::Instr(c)]);
        assert!(pure_except_deopt(&code));

        code.push(bb, Tag::StVar { name: Symbol(0) }, vec![Value::True, Value::BaseEnv]);
        assert!(!pure_except_deopt(&code));
    }

    #[test]
    fn test_predicates() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let bb = v.code.new_bb();
        let entry = v.code.entry;
        v.code.bb_mut(entry).next0 = Some(bb);
        let ld = v.code.push(bb, Tag::LdVar { name: Symbol(7) }, vec![Value::BaseEnv]);
        v.code.push(bb, Tag::Return, vec![Value::Instr(ld)]);

        assert!(no_env(&v));
        assert!(!no_load(&v, None));
        assert!(!no_load(&v, Some(Symbol(7))));
        assert!(no_load(&v, Some(Symbol(8))));
        assert!(no_store(&v, None));
        assert!(has_instr(&v, "ldvar"));
        assert!(!has_instr(&v, "call"));
        assert_eq!(deopt_count(&v), 0);
        assert_eq!(phi_count(&v), 0);
        assert!(check(&v, CheckProperty::NoExternalCalls));
    }
}
