//! Constant folding and speculative branch pruning.
//!
//! Per-opcode folds evaluate through the host; control-flow folds convert
//! constant branches into jumps, delete satisfied assumptions, and lower
//! contradicted assumptions to `Unreachable`. A branch dominated by another
//! branch on the same condition folds to the known side.

use super::{Pass, PassCtx};
use crate::cfg::{DominanceGraph, CFG};
use crate::ir::code::Code;
use crate::ir::tag::{Tag, TypeTestKind};
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;
use tarn_bytecode::value::{BcValue, Builtin, SexpKind};
use tarn_bytecode::ConstPool;

pub struct Constantfold;

impl Pass for Constantfold {
    fn name(&self) -> &'static str {
        "constant-fold"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let mut changed = fold_code(&mut version.code, ctx);
        for id in version.promise_ids() {
            if let Some(p) = version.promises.get_mut(id) {
                changed |= fold_code(&mut p.code, ctx);
            }
        }
        changed
    }
}

/// The constant a value denotes, if statically known.
pub fn known_const(code: &Code, pool: &ConstPool, v: &Value) -> Option<BcValue> {
    match v {
        Value::True => Some(BcValue::TRUE),
        Value::False => Some(BcValue::FALSE),
        Value::Nil => Some(BcValue::Nil),
        Value::Missing => Some(BcValue::Missing),
        Value::Unbound => Some(BcValue::Unbound),
        Value::Instr(id) => match code.instr(*id).tag {
            Tag::LdConst { idx } => Some(pool.get(idx).clone()),
            _ => None,
        },
        _ => None,
    }
}

/// Wrap a host value back into the IR: singletons stay singletons, the rest
/// goes through the pool.
fn materialize(
    code: &mut Code,
    pool: &mut ConstPool,
    bb: crate::ir::bb::BBId,
    pos: usize,
    value: BcValue,
) -> Value {
    match value {
        BcValue::Lgl(Some(true)) => Value::True,
        BcValue::Lgl(Some(false)) => Value::False,
        BcValue::Nil => Value::Nil,
        v => {
            let idx = pool.insert(v.clone());
            let id = code.insert_at(bb, pos, Tag::LdConst { idx }, vec![]);
            let mut t = PirType::from_sexp(v.sexp_kind()).not_object().no_attribs();
            if v.is_scalar() {
                t = t.scalar();
            }
            if !v.any_na() {
                t = t.not_na();
            }
            code.instr_mut(id).ty = t;
            Value::Instr(id)
        }
    }
}

fn fold_code(code: &mut Code, ctx: &mut PassCtx) -> bool {
    let mut changed = false;
    changed |= fold_instrs(code, ctx);
    changed |= fold_branches(code);
    changed |= fold_assumes(code);
    changed |= fold_dominated_branches(code);
    changed
}

fn fold_instrs(code: &mut Code, ctx: &mut PassCtx) -> bool {
    let mut changed = false;
    for bb in code.bb_ids() {
        let mut pos = 0;
        while pos < code.bb(bb).instrs.len() {
            let id = code.bb(bb).instrs[pos];
            if let Some(replacement) = fold_one(code, ctx, bb, pos, id) {
                code.replace_uses_with(id, replacement);
                code.remove_instr(id);
                changed = true;
                // Stay at the same position: the replacement may have been
                // inserted here
                continue;
            }
            pos += 1;
        }
    }
    changed
}

/// Try to fold one instruction to a value.
fn fold_one(
    code: &mut Code,
    ctx: &mut PassCtx,
    bb: crate::ir::bb::BBId,
    pos: usize,
    id: InstrId,
) -> Option<Value> {
    let instr = code.instr(id);
    let tag = instr.tag.clone();
    let args = instr.args.clone();

    match &tag {
        t if t.is_binop() => {
            let l = known_const(code, ctx.pool, &args[0])?;
            let r = known_const(code, ctx.pool, &args[1])?;
            let out = ctx.host.eval_binop(t, &l, &r)?;
            Some(materialize(code, ctx.pool, bb, pos, out))
        }
        t if t.is_unop() => {
            let v = known_const(code, ctx.pool, &args[0])?;
            let out = ctx.host.eval_unop(t, &v)?;
            Some(materialize(code, ctx.pool, bb, pos, out))
        }
        Tag::Identical => {
            // A test of a value against itself, or of two constants
            if args[0] == args[1] && !matches!(args[0], Value::Instr(_)) {
                return Some(Value::True);
            }
            // identical(x, TRUE) of a machine test is the test itself
            if args[1] == Value::True && args[0].ty(code).is_a(&PirType::test()) {
                return Some(args[0]);
            }
            let l = known_const(code, ctx.pool, &args[0])?;
            let r = known_const(code, ctx.pool, &args[1])?;
            Some(if l.identical(&r) { Value::True } else { Value::False })
        }
        Tag::CheckTrueFalse => {
            let v = known_const(code, ctx.pool, &args[0])?;
            match v.as_test() {
                Some(true) => Some(Value::True),
                Some(false) => Some(Value::False),
                None => None,
            }
        }
        Tag::AsLogical => {
            // Idempotent on logicals
            if args[0].ty(code).is_a(&PirType::lgl()) {
                return Some(args[0]);
            }
            let v = known_const(code, ctx.pool, &args[0])?;
            let out = ctx.host.eval_builtin(Builtin::AsLogical, &[&v])?;
            Some(materialize(code, ctx.pool, bb, pos, out))
        }
        Tag::IsKind { kind } => {
            let ty = args[0].ty(code);
            let test = PirType::from_sexp(*kind);
            if ty.forced().is_a(&test) {
                return Some(Value::True);
            }
            if ty.forced().intersect(&test).is_bottom() && !ty.maybe_promise_wrapped() {
                return Some(Value::False);
            }
            None
        }
        Tag::TypeTest { test } => {
            let ty = args[0].ty(code);
            match test {
                TypeTestKind::Object => {
                    if !ty.maybe_obj() {
                        // The test asks "is an object"; a type that cannot be
                        // one answers false
                        return Some(Value::False);
                    }
                    None
                }
                TypeTestKind::IsA(expected) => {
                    if ty.is_a(expected) {
                        return Some(Value::True);
                    }
                    if ty.intersect(expected).is_bottom() {
                        return Some(Value::False);
                    }
                    None
                }
                TypeTestKind::EnvStub => None,
            }
        }
        Tag::Length => {
            if args[0].ty(code).is_scalar() {
                return Some(materialize(code, ctx.pool, bb, pos, BcValue::Int(1)));
            }
            let v = known_const(code, ctx.pool, &args[0])?;
            Some(materialize(code, ctx.pool, bb, pos, BcValue::Int(v.length() as i32)))
        }
        Tag::CallSafeBuiltin { builtin, .. } => {
            // length of a known scalar, is.* settled by the static type
            if *builtin == Builtin::Length && args[0].ty(code).is_scalar() {
                return Some(materialize(code, ctx.pool, bb, pos, BcValue::Int(1)));
            }
            if let Some(kind) = kind_answered(*builtin) {
                let ty = args[0].ty(code).forced();
                let test = PirType::from_sexp(kind);
                if ty.is_a(&test) {
                    return Some(Value::True);
                }
                if ty.intersect(&test).is_bottom() {
                    return Some(Value::False);
                }
            }
            if *builtin == Builtin::IsObject && !args[0].ty(code).maybe_obj() {
                return Some(Value::False);
            }
            if matches!(builtin, Builtin::IsNa | Builtin::AnyNa)
                && !args[0].ty(code).maybe_na()
                && args[0].ty(code).is_scalar()
            {
                return Some(Value::False);
            }
            let consts: Option<Vec<BcValue>> =
                args.iter().map(|a| known_const(code, ctx.pool, a)).collect();
            let consts = consts?;
            let refs: Vec<&BcValue> = consts.iter().collect();
            let out = ctx.host.eval_builtin(*builtin, &refs)?;
            Some(materialize(code, ctx.pool, bb, pos, out))
        }
        _ => None,
    }
}

fn kind_answered(builtin: Builtin) -> Option<SexpKind> {
    crate::ir::instr::builtin_is_kind(builtin)
}

/// Convert branches on constants into jumps.
fn fold_branches(code: &mut Code) -> bool {
    let mut changed = false;
    for bb in code.bb_ids() {
        let Some(last) = code.bb(bb).last() else { continue };
        if !matches!(code.instr(last).tag, Tag::Branch) {
            continue;
        }
        let cond = code.instr(last).args[0];
        let taken = match cond {
            Value::True => true,
            Value::False => false,
            _ => continue,
        };
        let block = code.bb(bb);
        let (keep, drop) = if taken {
            (block.next0, block.next1)
        } else {
            (block.next1, block.next0)
        };
        let pos = code.bb(bb).instrs.len() - 1;
        code.remove_at(bb, pos);
        code.bb_mut(bb).next0 = keep;
        code.bb_mut(bb).next1 = None;
        if let Some(dead) = drop {
            if Some(dead) != keep {
                code.drop_phi_input(dead, bb);
            }
        }
        changed = true;
    }
    changed
}

/// Delete satisfied assumptions; contradicted ones make the tail
/// unreachable.
fn fold_assumes(code: &mut Code) -> bool {
    let mut changed = false;
    for bb in code.bb_ids() {
        let mut pos = 0;
        while pos < code.bb(bb).instrs.len() {
            let id = code.bb(bb).instrs[pos];
            let Tag::Assume { not, .. } = code.instr(id).tag else {
                pos += 1;
                continue;
            };
            let holds = match code.instr(id).args[0] {
                Value::True => Some(!not),
                Value::False => Some(not),
                _ => None,
            };
            match holds {
                Some(true) => {
                    code.remove_at(bb, pos);
                    changed = true;
                }
                Some(false) => {
                    // Everything from here on cannot execute
                    while code.bb(bb).instrs.len() > pos {
                        code.remove_at(bb, pos);
                    }
                    let (n0, n1) = (code.bb(bb).next0, code.bb(bb).next1);
                    code.bb_mut(bb).next0 = None;
                    code.bb_mut(bb).next1 = None;
                    for succ in [n0, n1].into_iter().flatten() {
                        code.drop_phi_input(succ, bb);
                    }
                    code.push(bb, Tag::Unreachable, vec![]);
                    changed = true;
                    break;
                }
                None => pos += 1,
            }
        }
    }
    changed
}

/// A branch strictly dominated by another branch on the same condition
/// already knows its outcome on each side.
fn fold_dominated_branches(code: &mut Code) -> bool {
    let cfg = CFG::new(code);
    let dom = DominanceGraph::new(code, &cfg);

    // condition -> branch blocks, in discovery order
    let mut by_cond: Vec<(Value, crate::ir::bb::BBId)> = Vec::new();
    for bb in code.bb_ids() {
        if let Some(last) = code.bb(bb).last() {
            if matches!(code.instr(last).tag, Tag::Branch) {
                if let v @ Value::Instr(_) = code.instr(last).args[0] {
                    by_cond.push((v, bb));
                }
            }
        }
    }

    let mut changed = false;
    for (i, (cond, first)) in by_cond.iter().enumerate() {
        for (cond2, second) in by_cond.iter().skip(i + 1) {
            if cond != cond2 || first == second {
                continue;
            }
            let (Some(t_side), Some(f_side)) = (code.bb(*first).next0, code.bb(*first).next1)
            else {
                continue;
            };
            let known = if dom.dominates(t_side, *second) && !dom.dominates(f_side, *second) {
                Some(Value::True)
            } else if dom.dominates(f_side, *second) && !dom.dominates(t_side, *second) {
                Some(Value::False)
            } else {
                None
            };
            if let Some(k) = known {
                let last = code.bb(*second).last().unwrap();
                code.instr_mut(last).args[0] = k;
                changed = true;
            }
        }
    }
    if changed {
        fold_branches(code);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::FunId;

    fn run_fold(version: &mut ClosureVersion, pool: &mut ConstPool) -> bool {
        let module = crate::ir::module::Module::new();
        let functions = Vec::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();
        let mut ctx = PassCtx {
            module: &module,
            functions: &functions,
            pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        Constantfold.run(version, &mut ctx)
    }

    #[test]
    fn test_fold_arith() {
        let mut pool = ConstPool::new();
        let three = pool.insert(BcValue::Int(3));
        let four = pool.insert(BcValue::Int(4));

        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        let a = code.push(bb, Tag::LdConst { idx: three }, vec![]);
        let b = code.push(bb, Tag::LdConst { idx: four }, vec![]);
        let sum = code.push(bb, Tag::Add, vec![Value::Instr(a), Value::Instr(b), Value::ElidedEnv]);
        code.push(bb, Tag::Return, vec![Value::Instr(sum)]);

        assert!(run_fold(&mut v, &mut pool));
        assert!(crate::query::returns(&v, |code, val| {
            if let Value::Instr(id) = val {
                if let Tag::LdConst { idx } = &code.instr(*id).tag {
                    return *pool.get(*idx) == BcValue::Int(7);
                }
            }
            false
        }));
    }

    #[test]
    fn test_branch_true_becomes_jump() {
        let mut pool = ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let t = code.new_bb();
        let f = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        code.push(bb, Tag::Branch, vec![Value::True]);
        code.bb_mut(bb).next0 = Some(t);
        code.bb_mut(bb).next1 = Some(f);
        code.push(t, Tag::Return, vec![Value::True]);
        code.push(f, Tag::Return, vec![Value::False]);

        assert!(run_fold(&mut v, &mut pool));
        assert!(v.code.bb(crate::ir::bb::BBId(1)).is_jump());
    }

    #[test]
    fn test_assume_true_deleted_false_unreachable() {
        let mut pool = ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        // A satisfied assumption (checkpoint edge not needed for the fold)
        code.push(
            bb,
            Tag::Assume { not: false, reason: crate::ir::tag::DeoptReason::Unknown },
            vec![Value::True, Value::Tombstone(crate::ir::value::Tombstone::FrameState)],
        );
        code.push(bb, Tag::Return, vec![Value::Nil]);
        assert!(run_fold(&mut v, &mut pool));
        assert!(!crate::query::has_instr(&v, "assume"));

        // A contradicted assumption truncates the block
        let code = &mut v.code;
        let bb2 = code.new_bb();
        code.bb_mut(bb).next0 = None;
        // rebuild: entry -> bb2
        code.bb_mut(entry).next0 = Some(bb2);
        code.push(
            bb2,
            Tag::Assume { not: false, reason: crate::ir::tag::DeoptReason::Unknown },
            vec![Value::False, Value::Tombstone(crate::ir::value::Tombstone::FrameState)],
        );
        code.push(bb2, Tag::Return, vec![Value::Nil]);
        assert!(run_fold(&mut v, &mut pool));
        assert!(crate::query::has_instr(&v, "unreachable"));
        assert!(!crate::query::has_instr(&v, "return"));
    }

    #[test]
    fn test_identical_self_and_test() {
        let mut pool = ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        let t = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        code.instr_mut(t).ty = PirType::test();
        let ident = code.push(bb, Tag::Identical, vec![Value::Instr(t), Value::True]);
        code.push(bb, Tag::Branch, vec![Value::Instr(ident)]);
        let a = code.new_bb();
        let b = code.new_bb();
        code.bb_mut(bb).next0 = Some(a);
        code.bb_mut(bb).next1 = Some(b);
        code.push(a, Tag::Return, vec![Value::True]);
        code.push(b, Tag::Return, vec![Value::False]);

        assert!(run_fold(&mut v, &mut pool));
        // identical(t, TRUE) collapsed to t
        assert!(!crate::query::has_instr(&v, "identical"));
    }

    #[test]
    fn test_is_kind_settled_by_type() {
        let mut pool = ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        let x = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        code.instr_mut(x).ty = PirType::int().scalar();
        let is_int = code.push(bb, Tag::IsKind { kind: SexpKind::Int }, vec![Value::Instr(x)]);
        code.push(bb, Tag::Return, vec![Value::Instr(is_int)]);

        assert!(run_fold(&mut v, &mut pool));
        assert!(crate::query::returns(&v, |_, val| *val == Value::True));
    }
}
