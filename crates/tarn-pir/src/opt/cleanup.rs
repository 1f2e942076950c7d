//! Cleanup passes: dead code, trivial phis, block-graph normalization,
//! unused checkpoints, and frame-state detachment.

use rustc_hash::FxHashSet;

use super::{Pass, PassCtx};
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;
use crate::visitor::Visitor;

pub struct Cleanup;

impl Pass for Cleanup {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let mut changed = cleanup_code(&mut version.code);
        for id in version.promise_ids() {
            if let Some(p) = version.promises.get_mut(id) {
                changed |= cleanup_code(&mut p.code);
            }
        }
        changed |= drop_unused_promises(version);
        changed
    }
}

fn cleanup_code(code: &mut Code) -> bool {
    let mut changed = false;
    changed |= fold_trivial(code);
    changed |= dead_code(code);
    changed |= drop_unreachable(code);
    changed |= merge_chains(code);
    changed |= skip_empty_blocks(code);
    if changed {
        code.renumber_bbs();
        code.gc();
    }
    changed
}

/// Nops, forces of already-forced values, single-input phis.
fn fold_trivial(code: &mut Code) -> bool {
    let mut changed = false;
    for bb in code.bb_ids() {
        let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
        for id in ids {
            if code.instr(id).deleted {
                continue;
            }
            match &code.instr(id).tag {
                Tag::Nop => {
                    code.remove_instr(id);
                    changed = true;
                }
                Tag::Force { .. } => {
                    let arg = code.instr(id).args[0];
                    if !arg.ty(code).maybe_promise_wrapped() {
                        code.replace_uses_with(id, arg);
                        code.remove_instr(id);
                        changed = true;
                    }
                }
                Tag::Phi { .. } => {
                    let args = &code.instr(id).args;
                    let mut unique: Option<Value> = None;
                    let mut trivial = true;
                    for a in args {
                        if *a == Value::Instr(id) {
                            continue;
                        }
                        match unique {
                            None => unique = Some(*a),
                            Some(u) if u == *a => {}
                            _ => {
                                trivial = false;
                                break;
                            }
                        }
                    }
                    if trivial {
                        if let Some(u) = unique {
                            code.replace_uses_with(id, u);
                            code.remove_instr(id);
                            changed = true;
                        }
                    }
                }
                Tag::PirCopy => {
                    let arg = code.instr(id).args[0];
                    code.replace_uses_with(id, arg);
                    code.remove_instr(id);
                    changed = true;
                }
                _ => {}
            }
        }
    }
    changed
}

/// Remove unobservable instructions with no remaining uses.
fn dead_code(code: &mut Code) -> bool {
    let mut changed = false;
    loop {
        let mut used: FxHashSet<InstrId> = FxHashSet::default();
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                for arg in &code.instr(*id).args {
                    if let Value::Instr(a) = arg {
                        used.insert(*a);
                    }
                }
            }
        });
        let mut removed = false;
        for bb in code.bb_ids() {
            let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
            for id in ids {
                let i = code.instr(id);
                if !i.deleted && i.is_removable() && i.produces_result() && !used.contains(&id) {
                    code.remove_instr(id);
                    removed = true;
                }
            }
        }
        // Effect-free void instructions with no role at all
        for bb in code.bb_ids() {
            let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
            for id in ids {
                let i = code.instr(id);
                if !i.deleted && i.is_removable() && !i.produces_result() {
                    code.remove_instr(id);
                    removed = true;
                }
            }
        }
        if !removed {
            break;
        }
        changed = true;
    }
    changed
}

/// Delete blocks unreachable from the entry; phis lose their inputs.
fn drop_unreachable(code: &mut Code) -> bool {
    let reachable: FxHashSet<_> = code.reachable_from(code.entry).into_iter().collect();
    let mut changed = false;
    for bb in code.bb_ids() {
        if !reachable.contains(&bb) {
            let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
            for id in ids {
                code.remove_instr(id);
            }
            let block = code.bb_mut(bb);
            block.deleted = true;
            block.next0 = None;
            block.next1 = None;
            changed = true;
        }
    }
    if changed {
        // Phis referencing removed predecessors drop those inputs
        for bb in code.bb_ids() {
            let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
            for id in ids {
                let mut drop_at: Vec<usize> = Vec::new();
                if let Tag::Phi { inputs } = &code.instr(id).tag {
                    for (i, input) in inputs.iter().enumerate() {
                        if !reachable.contains(input) {
                            drop_at.push(i);
                        }
                    }
                }
                for i in drop_at.into_iter().rev() {
                    let instr = code.instr_mut(id);
                    if let Tag::Phi { inputs } = &mut instr.tag {
                        inputs.remove(i);
                        instr.args.remove(i);
                    }
                }
            }
        }
    }
    changed
}

/// Merge a jump-only edge A -> B when B's only predecessor is A.
fn merge_chains(code: &mut Code) -> bool {
    let mut changed = false;
    loop {
        let cfg = crate::cfg::CFG::new(code);
        let mut merged = false;
        for bb in code.bb_ids() {
            if bb == code.entry {
                continue;
            }
            let block = code.bb(bb);
            if !block.is_jump() {
                continue;
            }
            let succ = block.next0.unwrap();
            if succ == bb || succ == code.entry || cfg.preds(succ) != [bb] {
                continue;
            }
            // Trivial phis in succ were folded already; a remaining phi
            // blocks the merge
            if code.bb(succ).instrs.iter().any(|i| code.instr(*i).is_phi()) {
                continue;
            }
            let tail: Vec<InstrId> = code.bb(succ).instrs.clone();
            let (n0, n1) = (code.bb(succ).next0, code.bb(succ).next1);
            for id in &tail {
                code.instr_mut(*id).bb = bb;
            }
            code.bb_mut(bb).instrs.extend(tail);
            code.bb_mut(bb).next0 = n0;
            code.bb_mut(bb).next1 = n1;
            let sb = code.bb_mut(succ);
            sb.instrs.clear();
            sb.next0 = None;
            sb.next1 = None;
            sb.deleted = true;
            // Successor phis that named succ now come from bb
            for s in [n0, n1].into_iter().flatten() {
                code.relabel_phi_inputs(s, succ, bb);
            }
            merged = true;
            break;
        }
        if !merged {
            break;
        }
        changed = true;
    }
    changed
}

/// Drop empty jump-only blocks, rewiring predecessors straight through.
fn skip_empty_blocks(code: &mut Code) -> bool {
    let mut changed = false;
    loop {
        let cfg = crate::cfg::CFG::new(code);
        let mut removed = false;
        for bb in code.bb_ids() {
            if bb == code.entry {
                continue;
            }
            let block = code.bb(bb);
            if !block.is_jump() || !block.instrs.is_empty() {
                continue;
            }
            let succ = block.next0.unwrap();
            if succ == bb {
                continue;
            }
            let preds: Vec<_> = cfg.preds(bb).to_vec();
            if preds.is_empty() {
                continue;
            }
            // Phis in the successor must be expandable per predecessor
            let phi_ids: Vec<InstrId> = code
                .bb(succ)
                .instrs
                .iter()
                .filter(|i| code.instr(**i).is_phi())
                .copied()
                .collect();
            for phi in &phi_ids {
                let (inputs, args) = {
                    let instr = code.instr(*phi);
                    if let Tag::Phi { inputs } = &instr.tag {
                        (inputs.clone(), instr.args.clone())
                    } else {
                        continue;
                    }
                };
                if let Some(pos) = inputs.iter().position(|b| *b == bb) {
                    let val = args[pos];
                    let instr = code.instr_mut(*phi);
                    if let Tag::Phi { inputs } = &mut instr.tag {
                        inputs.remove(pos);
                        instr.args.remove(pos);
                        for p in &preds {
                            inputs.push(*p);
                        }
                    }
                    for _ in &preds {
                        code.instr_mut(*phi).args.push(val);
                    }
                }
            }
            for p in &preds {
                code.bb_mut(*p).replace_successor(bb, succ);
            }
            let block = code.bb_mut(bb);
            block.deleted = true;
            block.next0 = None;
            removed = true;
            break;
        }
        if !removed {
            break;
        }
        changed = true;
    }
    changed
}

/// Delete promise slots no `MkArg` references anymore.
fn drop_unused_promises(version: &mut ClosureVersion) -> bool {
    let mut used: FxHashSet<u16> = FxHashSet::default();
    let mut codes: Vec<&Code> = vec![&version.code];
    for id in version.promise_ids() {
        if let Some(p) = version.promise(id) {
            codes.push(&p.code);
        }
    }
    for code in codes {
        Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if let Tag::MkArg { prom } = code.instr(*id).tag {
                    used.insert(prom.0);
                }
            }
        });
    }
    let mut changed = false;
    for id in version.promise_ids() {
        if !used.contains(&id.0) {
            version.delete_promise(id);
            changed = true;
        }
    }
    changed
}

/// Remove checkpoints no assumption uses; their deopt branches die with
/// them.
pub struct CleanupCheckpoints;

impl Pass for CleanupCheckpoints {
    fn name(&self) -> &'static str {
        "cleanup-checkpoints"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;
        for bb in code.bb_ids() {
            let Some(last) = code.bb(bb).last() else { continue };
            if !matches!(code.instr(last).tag, Tag::Checkpoint) {
                continue;
            }
            let guarded = code.uses_of(last).iter().any(|u| {
                matches!(code.instr(*u).tag, Tag::Assume { .. })
            });
            if guarded {
                continue;
            }
            let pos = code.bb(bb).instrs.len() - 1;
            code.remove_at(bb, pos);
            code.bb_mut(bb).next1 = None;
            changed = true;
        }
        if changed {
            // The orphaned deopt branches are unreachable now
            cleanup_code(code);
        }
        changed
    }
}

/// Detach frame states from calls and forces. After this pass no new
/// speculation can be introduced, and unused frame states die.
pub struct CleanupFramestate;

impl Pass for CleanupFramestate {
    fn name(&self) -> &'static str {
        "cleanup-framestate"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut changed = false;
        for bb in code.bb_ids() {
            let ids: Vec<InstrId> = code.bb(bb).instrs.clone();
            for id in ids {
                let i = code.instr(id);
                if i.deleted || matches!(i.tag, Tag::Deopt | Tag::FrameState { .. }) {
                    continue;
                }
                if i.fs_slot().is_some() {
                    code.instr_mut(id).drop_frame_state();
                    changed = true;
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::tag::DeoptReason;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::{CodeRef, FunId, WhichCode};

    fn ctx_parts() -> (crate::ir::module::Module, Vec<tarn_bytecode::BcFunction>, tarn_bytecode::ConstPool)
    {
        (crate::ir::module::Module::new(), Vec::new(), tarn_bytecode::ConstPool::new())
    }

    fn run_pass(pass: &dyn Pass, version: &mut ClosureVersion) -> bool {
        let (module, functions, mut pool) = ctx_parts();
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
    fn test_dead_mkenv_removed() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let bb = v.code.new_bb();
        let entry = v.code.entry;
        v.code.bb_mut(entry).next0 = Some(bb);
        v.code.push(bb, Tag::MkEnv { names: vec![], stub: false }, vec![Value::BaseEnv]);
        let c = v.code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        v.code.push(bb, Tag::Return, vec![Value::Instr(c)]);

        assert!(run_pass(&Cleanup, &mut v));
        assert!(crate::query::no_env(&v));
    }

    #[test]
    fn test_force_of_forced_removed() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let bb = v.code.new_bb();
        let entry = v.code.entry;
        v.code.bb_mut(entry).next0 = Some(bb);
        let a = v.code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        v.code.instr_mut(a).ty = crate::ir::ty::PirType::int().scalar();
        let f1 = v.code.push(bb, Tag::Force { has_fs: false }, vec![Value::Instr(a)]);
        let f2 = v.code.push(bb, Tag::Force { has_fs: false }, vec![Value::Instr(f1)]);
        v.code.push(bb, Tag::Return, vec![Value::Instr(f2)]);

        assert!(run_pass(&Cleanup, &mut v));
        assert!(!crate::query::has_instr(&v, "force"));
    }

    #[test]
    fn test_unused_checkpoint_removed() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let cont = code.new_bb();
        let deopt = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        code.push(bb, Tag::Checkpoint, vec![]);
        code.bb_mut(bb).next0 = Some(cont);
        code.bb_mut(bb).next1 = Some(deopt);
        let fs = code.push(
            deopt,
            Tag::FrameState {
                code: CodeRef { fun: FunId(0), which: WhichCode::Body },
                pc: 0,
                stack_len: 0,
                in_promise: false,
                has_parent: false,
            },
            vec![Value::BaseEnv],
        );
        code.push(deopt, Tag::Deopt, vec![Value::Instr(fs)]);
        code.push(cont, Tag::Return, vec![Value::Nil]);

        assert!(run_pass(&CleanupCheckpoints, &mut v));
        assert!(!crate::query::has_instr(&v, "checkpoint"));
        assert_eq!(crate::query::deopt_count(&v), 0);
    }

    #[test]
    fn test_checkpoint_with_assume_kept() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let cont = code.new_bb();
        let deopt = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        let cp = code.push(bb, Tag::Checkpoint, vec![]);
        code.bb_mut(bb).next0 = Some(cont);
        code.bb_mut(bb).next1 = Some(deopt);
        let fs = code.push(
            deopt,
            Tag::FrameState {
                code: CodeRef { fun: FunId(0), which: WhichCode::Body },
                pc: 0,
                stack_len: 0,
                in_promise: false,
                has_parent: false,
            },
            vec![Value::BaseEnv],
        );
        code.push(deopt, Tag::Deopt, vec![Value::Instr(fs)]);
        let t = code.push(cont, Tag::LdArg { index: 0 }, vec![]);
        code.instr_mut(t).ty = crate::ir::ty::PirType::test();
        code.push(
            cont,
            Tag::Assume { not: false, reason: DeoptReason::Unknown },
            vec![Value::Instr(t), Value::Instr(cp)],
        );
        code.push(cont, Tag::Return, vec![Value::Nil]);

        assert!(!run_pass(&CleanupCheckpoints, &mut v));
        assert!(crate::query::has_instr(&v, "checkpoint"));
    }

    #[test]
    fn test_phi_single_input_folds() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let code = &mut v.code;
        let bb = code.new_bb();
        let entry = code.entry;
        code.bb_mut(entry).next0 = Some(bb);
        let a = code.push(bb, Tag::LdArg { index: 0 }, vec![]);
        let phi = code.insert_at(bb, 0, Tag::Phi { inputs: vec![entry] }, vec![Value::Instr(a)]);
        // Out-of-order def is fine here: the fold rewires before any check
        let _ = phi;
        let phi2 = code.bb(bb).instrs[0];
        code.push(bb, Tag::Return, vec![Value::Instr(phi2)]);

        assert!(run_pass(&Cleanup, &mut v));
        assert_eq!(crate::query::phi_count(&v), 0);
    }
}
