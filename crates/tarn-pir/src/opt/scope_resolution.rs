//! Scope resolution: promote binding loads to SSA values and delete stores
//! nothing can observe.
//!
//! The analogue of mem2reg for R environments. Loads whose abstract value is
//! a single definition are replaced outright; loads fed by several
//! definitions get phis placed on the iterated dominance frontier of the
//! defining blocks. Super-loads and super-stores whose parent environment is
//! locally known collapse into ordinary loads and stores one level up.

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Pass, PassCtx};
use crate::analysis::scope::{self, CalleeProperties};
use crate::cfg::{DominanceFrontier, DominanceGraph, CFG};
use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::module::Module;
use crate::ir::tag::Tag;
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::{ClosureVersion, VersionProperties};

/// Callee property lookup backed by the module's dispatch tables.
pub struct ModuleCallees<'a>(pub &'a Module);

impl CalleeProperties for ModuleCallees<'_> {
    fn properties(&self, fun: tarn_bytecode::FunId) -> VersionProperties {
        let Some(cls) = self.0.closure_for_fun(fun) else {
            return VersionProperties::empty();
        };
        let dispatch = &self.0.closure(cls).dispatch;
        // Any compiled version establishes the property for the function
        for idx in dispatch.indices() {
            if let Some(v) = dispatch.version(idx) {
                return v.properties;
            }
        }
        VersionProperties::empty()
    }
}

pub struct ScopeResolution;

impl Pass for ScopeResolution {
    fn name(&self) -> &'static str {
        "scope-resolution"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let callees = ModuleCallees(ctx.module);
        resolve(&mut version.code, &callees)
    }
}

pub fn resolve(code: &mut Code, callees: &dyn CalleeProperties) -> bool {
    let results = scope::analyze(code, callees);
    let mut changed = false;

    let ids: Vec<InstrId> = {
        let mut out = Vec::new();
        crate::visitor::Visitor::run(code, |bb| out.extend(code.bb(bb).instrs.iter().copied()));
        out
    };

    // Resolve loads first; deleting stores below would orphan their origins
    for id in &ids {
        let id = *id;
        if code.instr(id).deleted {
            continue;
        }
        match code.instr(id).tag.clone() {
            Tag::LdVarSuper { name } => {
                let env = code.instr(id).args[0];
                if let Some(parent) = results.final_state.envs.parent_of(env) {
                    let bb = code.instr(id).bb;
                    let pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();
                    let new = code.replace_at(bb, pos, Tag::LdVar { name }, vec![parent]);
                    code.replace_uses_with(id, Value::Instr(new));
                    changed = true;
                }
            }
            Tag::LdVar { .. } | Tag::LdFun { .. } => {
                let Some(load) = results.loads.get(&id) else { continue };
                if load.result.is_unknown() {
                    continue;
                }
                let is_fun = matches!(code.instr(id).tag, Tag::LdFun { .. });
                if let Some(replacement) = materialize_load(code, id, load) {
                    let final_value = if is_fun && replacement.ty(code).maybe_promise_wrapped() {
                        // Function lookup forces on the way
                        let bb = code.instr(id).bb;
                        let pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();
                        let f = code.insert_at(bb, pos, Tag::Force { has_fs: false }, vec![replacement]);
                        code.update_type_and_effects(f);
                        Value::Instr(f)
                    } else {
                        replacement
                    };
                    code.replace_uses_with(id, final_value);
                    code.remove_instr(id);
                    changed = true;
                }
            }
            _ => {}
        }
    }

    // Then rewrite super-stores and drop unobservable stores
    for id in &ids {
        let id = *id;
        if code.instr(id).deleted {
            continue;
        }
        match code.instr(id).tag.clone() {
            Tag::StVarSuper { name } => {
                let env = code.instr(id).args[1];
                if let Some(parent) = results.final_state.envs.parent_of(env) {
                    if results.final_state.envs.known(parent) {
                        let val = code.instr(id).args[0];
                        let bb = code.instr(id).bb;
                        let pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();
                        code.replace_at(bb, pos, Tag::StVar { name }, vec![val, parent]);
                        changed = true;
                    }
                }
            }
            Tag::StVar { .. } => {
                let env = code.instr(id).args[1];
                if !results.observed_stores.contains(&id) && !results.leaked_at_exit(env) {
                    code.remove_instr(id);
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

/// Turn a load's abstract value into a concrete SSA value at the load site,
/// inserting phis on the iterated dominance frontier when several
/// definitions contribute. None when the reaching values cannot be
/// reconstructed.
fn materialize_load(
    code: &mut Code,
    load: InstrId,
    aload: &crate::analysis::abstract_value::AbstractLoad,
) -> Option<Value> {
    if let Some(single) = aload.result.single_value() {
        return Some(single.val);
    }

    let cfg = CFG::new(code);
    let dom = DominanceGraph::new(code, &cfg);
    let df = DominanceFrontier::new(&cfg, &dom);

    // Last contributing definition per block
    let mut defs: FxHashMap<BBId, (usize, Value)> = FxHashMap::default();
    for source in aload.result.sources() {
        let bb = code.instr(source.origin).bb;
        if !cfg.is_reachable(bb) {
            continue;
        }
        let pos = code.bb(bb).instrs.iter().position(|i| *i == source.origin)?;
        match defs.get(&bb) {
            Some((p, _)) if *p >= pos => {}
            _ => {
                defs.insert(bb, (pos, source.val));
            }
        }
    }
    if defs.is_empty() {
        return None;
    }

    // Iterated dominance frontier of the defining blocks
    let mut phi_blocks: FxHashSet<BBId> = FxHashSet::default();
    let mut work: Vec<BBId> = defs.keys().copied().collect();
    while let Some(bb) = work.pop() {
        for f in df.at(bb) {
            if phi_blocks.insert(f) {
                work.push(f);
            }
        }
    }

    // Symbolic resolution: a block's exit value is its own def, its phi, or
    // its immediate dominator's exit value
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    enum Res {
        Known(Value),
        Phi(BBId),
    }
    let resolve_exit = |bb: BBId| -> Option<Res> {
        let mut cur = bb;
        loop {
            if let Some((_, v)) = defs.get(&cur) {
                return Some(Res::Known(*v));
            }
            if phi_blocks.contains(&cur) {
                return Some(Res::Phi(cur));
            }
            cur = dom.immediate_dominator(cur)?;
        }
    };

    // Which phis are actually needed, starting from the load
    let load_bb = code.instr(load).bb;
    let load_pos = code.bb(load_bb).instrs.iter().position(|i| *i == load)?;
    let load_res = match defs.get(&load_bb) {
        Some((p, v)) if *p < load_pos => Res::Known(*v),
        _ => {
            if phi_blocks.contains(&load_bb) {
                Res::Phi(load_bb)
            } else {
                resolve_exit(dom.immediate_dominator(load_bb)?)?
            }
        }
    };

    let mut needed: Vec<BBId> = Vec::new();
    let mut phi_args: FxHashMap<BBId, Vec<(BBId, Res)>> = FxHashMap::default();
    let mut queue: Vec<BBId> = match load_res {
        Res::Phi(bb) => vec![bb],
        Res::Known(_) => Vec::new(),
    };
    while let Some(bb) = queue.pop() {
        if needed.contains(&bb) {
            continue;
        }
        needed.push(bb);
        let mut args = Vec::new();
        for p in cfg.preds(bb) {
            let r = resolve_exit(*p)?;
            if let Res::Phi(next) = r {
                if next != bb && !needed.contains(&next) {
                    queue.push(next);
                }
            }
            args.push((*p, r));
        }
        if args.is_empty() {
            return None;
        }
        phi_args.insert(bb, args);
    }

    // Materialize the needed phis, then wire their arguments
    let mut phi_of: FxHashMap<BBId, InstrId> = FxHashMap::default();
    for bb in &needed {
        let id = code.insert_at(*bb, 0, Tag::Phi { inputs: vec![] }, vec![]);
        code.instr_mut(id).ty = PirType::bottom();
        phi_of.insert(*bb, id);
    }
    let to_value = |r: &Res, phi_of: &FxHashMap<BBId, InstrId>| -> Value {
        match r {
            Res::Known(v) => *v,
            Res::Phi(bb) => Value::Instr(phi_of[bb]),
        }
    };
    for bb in &needed {
        let args = &phi_args[bb];
        let inputs: Vec<BBId> = args.iter().map(|(p, _)| *p).collect();
        let values: Vec<Value> = args.iter().map(|(_, r)| to_value(r, &phi_of)).collect();
        let phi = phi_of[bb];
        code.instr_mut(phi).tag = Tag::Phi { inputs };
        code.instr_mut(phi).args = values;
        code.update_type_and_effects(phi);
    }
    // Propagate types once more now that phi cycles are closed
    for bb in &needed {
        code.update_type_and_effects(phi_of[bb]);
    }

    Some(to_value(&load_res, &phi_of))
}
