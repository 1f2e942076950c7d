//! Hoisting passes: sibling hoisting, loop-invariant loads, and
//! range-checked overflow narrowing.

use rustc_hash::FxHashSet;
use tarn_bytecode::Symbol;

use super::{Pass, PassCtx};
use crate::analysis::range::{Interval, RangeAnalysis};
use crate::cfg::{find_loops, DominanceGraph, CFG};
use crate::ir::code::Code;
use crate::ir::effects::Effects;
use crate::ir::tag::Tag;
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;

/// When both arms of a branch begin with the same pure computation, compute
/// it once before branching.
pub struct HoistInstruction;

impl Pass for HoistInstruction {
    fn name(&self) -> &'static str {
        "hoist-instruction"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;

        for bb in code.bb_ids() {
            let block = code.bb(bb);
            if !block.is_branch() {
                continue;
            }
            let (Some(a), Some(b)) = (block.next0, block.next1) else { continue };
            if a == b {
                continue;
            }
            let first = |code: &Code, side: crate::ir::bb::BBId| -> Option<InstrId> {
                code.bb(side)
                    .instrs
                    .iter()
                    .find(|i| !code.instr(**i).is_phi())
                    .copied()
            };
            let (Some(ia), Some(ib)) = (first(code, a), first(code, b)) else { continue };
            let (la, lb) = (code.instr(ia), code.instr(ib));
            if !la.effects.is_empty()
                || !la.produces_result()
                || la.tag != lb.tag
                || la.args != lb.args
                || matches!(la.tag, Tag::Phi { .. } | Tag::Checkpoint)
            {
                continue;
            }
            // Compute once in the parent, before the branch instruction
            let branch_pos = code.bb(bb).instrs.len().saturating_sub(1);
            code.move_instr(ia, bb, branch_pos);
            code.replace_uses_with(ib, Value::Instr(ia));
            code.remove_instr(ib);
            changed = true;
        }
        changed
    }
}

/// Move loads of loop-invariant bindings into the preheader.
pub struct LoopInvariant;

impl Pass for LoopInvariant {
    fn name(&self) -> &'static str {
        "loop-invariant"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cfg = CFG::new(code);
        let dom = DominanceGraph::new(code, &cfg);
        let loops = find_loops(code, &cfg, &dom);
        let mut changed = false;

        for l in loops {
            let Some(preheader) = l.preheader(&cfg) else { continue };
            let blocks: Vec<_> = std::iter::once(l.header).chain(l.body.iter().copied()).collect();

            // The loop must not run anything that could rewrite bindings
            let mut written: FxHashSet<Symbol> = FxHashSet::default();
            let mut opaque = false;
            for bb in &blocks {
                for id in &code.bb(*bb).instrs {
                    let instr = code.instr(*id);
                    match &instr.tag {
                        Tag::StVar { name } | Tag::StVarSuper { name } => {
                            written.insert(*name);
                        }
                        t if t.is_call() => opaque = true,
                        _ => {
                            if instr.effects.taints_env() {
                                opaque = true;
                            }
                        }
                    }
                }
            }
            if opaque {
                continue;
            }

            let mut hoistable: Vec<InstrId> = Vec::new();
            for bb in &blocks {
                for id in &code.bb(*bb).instrs {
                    let instr = code.instr(*id);
                    let name = match &instr.tag {
                        Tag::LdVar { name } | Tag::LdFun { name } => *name,
                        _ => continue,
                    };
                    if written.contains(&name) {
                        continue;
                    }
                    // The environment must already exist at the preheader
                    let env_ok = match instr.args[0] {
                        Value::Instr(e) => dom.dominates(code.instr(e).bb, preheader),
                        _ => true,
                    };
                    if env_ok {
                        hoistable.push(*id);
                    }
                }
            }

            for id in hoistable {
                let last_is_terminator = code
                    .bb(preheader)
                    .last()
                    .map(|l| code.instr(l).tag.is_branching() || code.instr(l).tag.is_exit())
                    .unwrap_or(false);
                let pos = if last_is_terminator {
                    code.bb(preheader).instrs.len() - 1
                } else {
                    code.bb(preheader).instrs.len()
                };
                code.move_instr(id, preheader, pos);
                changed = true;
            }
        }
        changed
    }
}

/// Use range information to prove integer arithmetic cannot overflow, and
/// narrow its result type accordingly.
pub struct Overflow;

impl Pass for Overflow {
    fn name(&self) -> &'static str {
        "overflow"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;

        let pool = &*ctx.pool;
        let consts = |id: InstrId| -> Option<i64> {
            match code.instr(id).tag {
                Tag::LdConst { idx } => pool.get(idx).as_int().map(|v| v as i64),
                _ => None,
            }
        };
        let ranges = RangeAnalysis::compute(code, &consts);

        let mut narrowed: Vec<(InstrId, PirType)> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                if !matches!(instr.tag, Tag::Add | Tag::Sub | Tag::Mul) {
                    continue;
                }
                let int_scalar = PirType::int().scalar();
                let lhs = instr.args[0];
                let rhs = instr.args[1];
                if !lhs.ty(code).is_a(&int_scalar.or_na())
                    || !rhs.ty(code).is_a(&int_scalar.or_na())
                {
                    continue;
                }
                // Already narrow?
                if instr.ty.is_a(&int_scalar.or_na()) {
                    continue;
                }
                let (Value::Instr(l), Value::Instr(r)) = (lhs, rhs) else { continue };
                let li = ranges.interval_before(code, *id, l, &consts);
                let ri = ranges.interval_before(code, *id, r, &consts);
                if !li.is_finite() || !ri.is_finite() {
                    continue;
                }
                let result = match instr.tag {
                    Tag::Add => Interval { lo: li.lo + ri.lo, hi: li.hi + ri.hi },
                    Tag::Sub => Interval { lo: li.lo - ri.hi, hi: li.hi - ri.lo },
                    _ => {
                        let p = [li.lo * ri.lo, li.lo * ri.hi, li.hi * ri.lo, li.hi * ri.hi];
                        Interval {
                            lo: *p.iter().min().unwrap(),
                            hi: *p.iter().max().unwrap(),
                        }
                    }
                };
                if result.lo > i32::MIN as i64 && result.hi <= i32::MAX as i64 {
                    let mut t = instr.ty.intersect(&PirType::int());
                    t = t.scalar();
                    narrowed.push((*id, t));
                }
            }
        });

        let changed = !narrowed.is_empty();
        for (id, ty) in narrowed {
            code.instr_mut(id).ty = ty;
            code.instr_mut(id).effects -= Effects::WARN;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{Formals, FunId};
    use tarn_bytecode::value::BcValue;

    fn run(pass: &dyn Pass, version: &mut ClosureVersion, pool: &mut tarn_bytecode::ConstPool) -> bool {
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
        pass.run(version, &mut ctx)
    }

    #[test]
    fn test_sibling_hoist() {
        let mut pool = tarn_bytecode::ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let x = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(x.as_instr().unwrap()).ty = PirType::test();
        let t = b.create_bb();
        let f = b.create_bb();
        b.branch(x, t, f);
        b.seek(t);
        let l1 = b.add(Tag::Length, vec![x]);
        b.add(Tag::Return, vec![l1]);
        b.seek(f);
        let l2 = b.add(Tag::Length, vec![x]);
        b.add(Tag::Return, vec![l2]);

        assert!(run(&HoistInstruction, &mut v, &mut pool));
        assert_eq!(crate::ir::verify::verify_code(&v.code), Ok(()));
        let mut lengths = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::Length) {
                    lengths += 1;
                }
            }
        });
        assert_eq!(lengths, 1);
    }

    #[test]
    fn test_loop_invariant_load_hoisted() {
        let mut pool = tarn_bytecode::ConstPool::new();
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let header = b.create_bb();
        let body = b.create_bb();
        let exit = b.create_bb();
        b.jump(header);

        b.seek(header);
        let c = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(c.as_instr().unwrap()).ty = PirType::test();
        b.branch(c, body, exit);

        b.seek(body);
        let ld = b.add(Tag::LdVar { name: Symbol(7) }, vec![env]);
        b.code.push(body, Tag::StVar { name: Symbol(8) }, vec![ld, env]);
        b.jump(header);

        b.seek(exit);
        b.add(Tag::Return, vec![Value::Nil]);

        assert!(run(&LoopInvariant, &mut v, &mut pool));
        assert_eq!(crate::ir::verify::verify_code(&v.code), Ok(()));
        // The load of the never-written binding left the loop
        let preheader_bb = v.code.instr(ld.as_instr().unwrap()).bb;
        assert_ne!(preheader_bb, body);
    }

    #[test]
    fn test_overflow_narrows_bounded_add() {
        let mut pool = tarn_bytecode::ConstPool::new();
        let three = pool.insert(BcValue::Int(3));
        let four = pool.insert(BcValue::Int(4));

        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let a = b.add(Tag::LdConst { idx: three }, vec![]);
        b.code.instr_mut(a.as_instr().unwrap()).ty = PirType::int().scalar().not_object().not_na();
        let c = b.add(Tag::LdConst { idx: four }, vec![]);
        b.code.instr_mut(c.as_instr().unwrap()).ty = PirType::int().scalar().not_object().not_na();
        let sum = b.add(Tag::Add, vec![a, c, Value::ElidedEnv]);
        b.code.update_type_and_effects(sum.as_instr().unwrap());
        b.add(Tag::Return, vec![sum]);

        // After inference the add may still produce a real on overflow
        assert!(v.code.instr(sum.as_instr().unwrap()).ty.maybe(crate::ir::ty::RTypeSet::REAL));
        assert!(run(&Overflow, &mut v, &mut pool));
        let ty = v.code.instr(sum.as_instr().unwrap()).ty;
        assert!(ty.is_a(&PirType::int().or_na()));
        assert!(ty.is_scalar());
    }
}
