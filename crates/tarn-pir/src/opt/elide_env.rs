//! Environment elision, static and speculative.
//!
//! An environment that exists only to serve method dispatch can be dropped
//! once no operand can be an object: statically when the types prove it,
//! speculatively when runtime feedback claims it and a checkpoint is there
//! to catch a lie. An environment whose only remaining uses are frame
//! states is demoted to a stub that deopt materializes on demand.

use super::{Pass, PassCtx};
use crate::analysis::checkpoints::AvailableCheckpoints;
use crate::ir::tag::{DeoptReason, Tag, TypeTestKind};
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;
use crate::visitor::Visitor;

pub struct ElideEnv;

impl Pass for ElideEnv {
    fn name(&self) -> &'static str {
        "elide-env"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;

        let mut envs: Vec<InstrId> = Vec::new();
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if matches!(code.instr(*id).tag, Tag::MkEnv { .. }) {
                    envs.push(*id);
                }
            }
        });

        for env in envs {
            let uses = code.uses_of(env);
            let all_elidable = !uses.is_empty()
                && uses.iter().all(|u| {
                    let instr = code.instr(*u);
                    instr.env() == Some(Value::Instr(env))
                        && instr.env_only_for_obj()
                        && instr
                            .args
                            .iter()
                            .take(instr.env_slot().unwrap())
                            .all(|a| !a.ty(code).maybe_obj())
                });
            if !all_elidable {
                continue;
            }
            for u in uses {
                code.instr_mut(u).set_env(Value::ElidedEnv);
                code.update_type_and_effects(u);
            }
            code.remove_instr(env);
            changed = true;
        }
        changed
    }
}

pub struct ElideEnvSpec;

impl Pass for ElideEnvSpec {
    fn name(&self) -> &'static str {
        "elide-env-spec"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cps = AvailableCheckpoints::compute(code);
        let mut changed = false;

        // Dispatch-only instructions whose operands were never objects at
        // run time
        let mut sites: Vec<(InstrId, Value)> = Vec::new();
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                if !instr.env_only_for_obj() {
                    continue;
                }
                match instr.env() {
                    Some(e @ Value::Instr(_)) | Some(e @ Value::BaseEnv) => {
                        let Some(cp) = cps.at(code, *id) else { continue };
                        let operands = &instr.args[..instr.env_slot().unwrap()];
                        let feedback_clean = operands.iter().all(|a| match a {
                            Value::Instr(src) => code
                                .instr(*src)
                                .type_feedback
                                .as_ref()
                                .map(|f| !f.maybe_object())
                                .unwrap_or(true),
                            _ => true,
                        });
                        if feedback_clean {
                            sites.push((*id, Value::Instr(cp)));
                        }
                        let _ = e;
                    }
                    _ => {}
                }
            }
        });

        for (id, cp) in sites {
            let bb = code.instr(id).bb;
            let Some(mut pos) = code.bb(bb).instrs.iter().position(|i| *i == id) else { continue };
            let operands: Vec<Value> =
                code.instr(id).args[..code.instr(id).env_slot().unwrap()].to_vec();
            for arg in operands {
                if arg.ty(code).maybe_obj() {
                    let test =
                        code.insert_at(bb, pos, Tag::TypeTest { test: TypeTestKind::Object }, vec![arg]);
                    pos += 1;
                    code.insert_at(
                        bb,
                        pos,
                        Tag::Assume { not: true, reason: DeoptReason::TypecheckFailed },
                        vec![Value::Instr(test), cp],
                    );
                    pos += 1;
                }
            }
            code.instr_mut(id).set_env(Value::ElidedEnv);
            let refined = code.instr(id).ty.not_object();
            code.instr_mut(id).ty = refined;
            code.update_type_and_effects(id);
            changed = true;
        }

        // Environments only frame states still see become stubs
        let mut envs: Vec<InstrId> = Vec::new();
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if matches!(code.instr(*id).tag, Tag::MkEnv { stub: false, .. }) {
                    envs.push(*id);
                }
            }
        });
        for env in envs {
            let uses = code.uses_of(env);
            let only_fs = !uses.is_empty()
                && uses.iter().all(|u| matches!(code.instr(*u).tag, Tag::FrameState { .. }));
            if only_fs {
                if let Tag::MkEnv { stub, .. } = &mut code.instr_mut(env).tag {
                    *stub = true;
                }
                changed = true;
            }
        }

        changed
    }
}
