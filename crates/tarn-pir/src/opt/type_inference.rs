//! Type inference and feedback-driven type speculation.
//!
//! Inference re-runs the per-opcode type/effect refinement until nothing
//! changes; it also narrows static calls whose target version is known
//! reflection-free. Speculation narrows a value to its observed type under a
//! guarded assumption, leaving a downcast that later passes can lean on.

use super::{Pass, PassCtx};
use crate::analysis::checkpoints::AvailableCheckpoints;
use crate::ir::effects::Effects;
use crate::ir::tag::{DeoptReason, Tag, TypeTestKind};
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::{ClosureVersion, VersionProperties};
use crate::visitor::BreadthFirstVisitor;

pub struct TypeInference;

impl Pass for TypeInference {
    fn name(&self) -> &'static str {
        "type-inference"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;
        loop {
            let mut round = false;
            for bb in BreadthFirstVisitor::order(code) {
                let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
                for id in ids {
                    round |= code.update_type_and_effects(id);
                    // A static call into a reflection-free version cannot
                    // taint our environments
                    if let Tag::StaticCall { fun, .. } = code.instr(id).tag {
                        use crate::analysis::scope::CalleeProperties;
                        let props =
                            super::scope_resolution::ModuleCallees(ctx.module).properties(fun);
                        if props.contains(VersionProperties::NO_REFLECTION)
                            && code.instr(id).effects.contains(Effects::REFLECTION)
                        {
                            code.instr_mut(id).effects -= Effects::REFLECTION;
                            round = true;
                        }
                    }
                }
            }
            if !round {
                break;
            }
            changed = true;
        }
        changed
    }
}

pub struct TypeSpeculation;

impl Pass for TypeSpeculation {
    fn name(&self) -> &'static str {
        "type-speculation"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cps = AvailableCheckpoints::compute(code);

        // Values whose observed type is strictly sharper than their static
        // type, with a checkpoint to guard the claim
        let mut sites: Vec<(InstrId, PirType, InstrId)> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                let Some(feedback) = &instr.type_feedback else { continue };
                if feedback.is_empty() || feedback.overflow {
                    continue;
                }
                // Narrow only what the lowered guard can actually check: the
                // value kind. Objecthood is guarded separately by the
                // environment-elision speculation.
                let mut observed = PirType::bottom();
                for rec in &feedback.records {
                    observed.merge(&PirType::from_sexp(rec.kind));
                }
                let observed = observed.or_object();
                let static_ty = instr.ty;
                if static_ty.is_a(&observed) || !observed.is_a(&static_ty.forced()) {
                    continue;
                }
                let Some(cp) = cps.next(code, *id) else { continue };
                sites.push((*id, observed, cp));
            }
        });

        let mut changed = false;
        for (id, observed, cp) in sites {
            let bb = code.instr(id).bb;
            let Some(pos) = code.bb(bb).instrs.iter().position(|i| *i == id) else { continue };
            // The test can sit right after the producer; the assumption and
            // the downcast only exist on the checkpoint's surviving branch
            let Some(cont) = code.bb(code.instr(cp).bb).next0 else { continue };
            let test = code.insert_at(
                bb,
                pos + 1,
                Tag::TypeTest { test: TypeTestKind::IsA(observed) },
                vec![Value::Instr(id)],
            );
            let leading_phis = code
                .bb(cont)
                .instrs
                .iter()
                .take_while(|i| code.instr(**i).is_phi())
                .count();
            code.insert_at(
                cont,
                leading_phis,
                Tag::Assume { not: false, reason: DeoptReason::TypecheckFailed },
                vec![Value::Instr(test), Value::Instr(cp)],
            );
            let cast = code.insert_at(
                cont,
                leading_phis + 1,
                Tag::CastType { up: false, from: code.instr(id).ty },
                vec![Value::Instr(id)],
            );
            code.instr_mut(cast).ty = observed;
            code.instr_mut(cast).effects = Effects::DEPENDS_ON_ASSUME;

            // Rewire only the uses the downcast dominates; the deopt branch
            // keeps the original value
            let cfg = crate::cfg::CFG::new(code);
            let dom = crate::cfg::DominanceGraph::new(code, &cfg);
            let cast_pos = leading_phis + 1;
            for u in code.uses_of(id) {
                if u == test || u == cast {
                    continue;
                }
                let ub = code.instr(u).bb;
                let dominated = if ub == cont {
                    code.bb(cont).instrs.iter().position(|i| *i == u).map(|p| p > cast_pos)
                        == Some(true)
                } else {
                    dom.dominates(cont, ub)
                };
                if dominated {
                    for arg in code.instr_mut(u).args.iter_mut() {
                        if *arg == Value::Instr(id) {
                            *arg = Value::Instr(cast);
                        }
                    }
                }
            }
            // The feedback is consumed
            code.instr_mut(id).type_feedback = None;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::feedback::{ObservedType, TypeRecord};
    use tarn_bytecode::module::{CodeRef, Formals, FunId, WhichCode};
    use tarn_bytecode::value::BcValue;

    fn run(pass: &dyn Pass, version: &mut ClosureVersion) -> bool {
        let module = crate::ir::module::Module::new();
        let functions = Vec::new();
        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();
        let mut ctx = PassCtx {
            module: &module,
            functions: &functions,
            pool: &mut pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        pass.run(version, &mut ctx)
    }

    #[test]
    fn test_inference_propagates_through_phi() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let t = b.create_bb();
        let f = b.create_bb();
        let join = b.create_bb();
        let c = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(c.as_instr().unwrap()).ty = crate::ir::ty::PirType::test();
        b.branch(c, t, f);
        b.seek(t);
        b.jump(join);
        b.seek(f);
        b.jump(join);
        b.seek(join);
        let phi = b.code.insert_at(join, 0, Tag::Phi { inputs: vec![t, f] }, vec![Value::True, Value::False]);
        b.code.push(join, Tag::Return, vec![Value::Instr(phi)]);

        run(&TypeInference, &mut v);
        assert!(v.code.instr(phi).ty.is_a(&crate::ir::ty::PirType::simple_lgl()));
    }

    #[test]
    fn test_speculation_inserts_guarded_cast() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;

        let ld = b.add(Tag::LdVar { name: tarn_bytecode::Symbol(5) }, vec![env]);
        let mut obs = ObservedType::default();
        obs.record(TypeRecord::of(&BcValue::Int(3)));
        b.code.instr_mut(ld.as_instr().unwrap()).type_feedback = Some(obs);

        // Checkpoint after the load so the speculation has a target
        let cont = b.create_bb();
        let deopt = b.create_bb();
        b.add(Tag::Checkpoint, vec![]);
        let cur = b.current;
        b.code.bb_mut(cur).next0 = Some(cont);
        b.code.bb_mut(cur).next1 = Some(deopt);
        b.seek(deopt);
        let fs = b.add(
            Tag::FrameState {
                code: CodeRef { fun: FunId(0), which: WhichCode::Body },
                pc: 0,
                stack_len: 0,
                in_promise: false,
                has_parent: false,
            },
            vec![env],
        );
        b.add(Tag::Deopt, vec![fs]);
        b.seek(cont);
        b.add(Tag::Return, vec![ld]);

        assert!(run(&TypeSpeculation, &mut v));
        assert_eq!(crate::ir::verify::verify_code(&v.code), Ok(()));
        assert!(crate::query::has_instr(&v, "typetest"));
        assert!(crate::query::has_instr(&v, "casttype"));
        // The return sees the narrowed value
        assert!(crate::query::returns(&v, |code, val| {
            matches!(val, Value::Instr(id)
                if matches!(code.instr(*id).tag, Tag::CastType { .. }))
        }));
    }
}
