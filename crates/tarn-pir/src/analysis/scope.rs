//! Scope analysis: abstract interpretation of loads and stores against
//! abstract environments.
//!
//! Produces, for every load, the set of SSA values the binding may hold, and
//! the set of stores whose written value escapes into a possibly-leaked
//! environment. Scope resolution consumes both to promote loads to SSA
//! values and delete unobservable stores.
//!
//! Taint discipline: an instruction that leaks an environment marks it
//! leaked; an instruction that can run user code taints the leaked
//! environments (anything visible to unknown code may be rewritten); a
//! statically-unknown call taints every known environment, since the callee
//! can reach our frame reflectively.

use rustc_hash::{FxHashMap, FxHashSet};

use super::abstract_value::{AbstractHierarchy, AbstractLoad};
use super::framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
use crate::ir::code::Code;
use crate::ir::effects::Effects;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::VersionProperties;

/// The abstract state: the environment hierarchy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopeState {
    pub envs: AbstractHierarchy,
}

impl AbstractState for ScopeState {
    fn merge(&mut self, other: &Self) -> AbstractRes {
        self.envs.merge(&other.envs)
    }
}

/// Looks up whether a static call target is known reflection-free.
pub trait CalleeProperties {
    fn properties(&self, fun: tarn_bytecode::FunId) -> VersionProperties;
}

/// No information about any callee.
pub struct NoCalleeInfo;

impl CalleeProperties for NoCalleeInfo {
    fn properties(&self, _fun: tarn_bytecode::FunId) -> VersionProperties {
        VersionProperties::empty()
    }
}

pub struct ScopeAnalysis<'a> {
    callees: &'a dyn CalleeProperties,
}

impl<'a> ScopeAnalysis<'a> {
    pub fn new(callees: &'a dyn CalleeProperties) -> ScopeAnalysis<'a> {
        ScopeAnalysis { callees }
    }
}

impl Analysis for ScopeAnalysis<'_> {
    type State = ScopeState;

    fn init(&self, _code: &Code) -> ScopeState {
        ScopeState::default()
    }

    fn apply(&self, state: &mut ScopeState, code: &Code, id: InstrId) {
        let instr = code.instr(id);
        let me = Value::Instr(id);

        match &instr.tag {
            Tag::MkEnv { names, .. } => {
                let parent = *instr.args.last().unwrap();
                let env = state.envs.env_mut(me);
                env.parent = Some(parent);
                env.tainted = false;
                for (i, name) in names.iter().enumerate() {
                    state.envs.env_mut(me).set(*name, instr.args[i], id, 0, code);
                }
            }
            Tag::LdFunctionEnv => {
                // A promise's environment: unknown contents, known identity
                state.envs.env_mut(me);
            }
            Tag::StVar { name } => {
                let env = instr.args[1];
                state.envs.env_mut(env).set(*name, instr.args[0], id, 0, code);
            }
            Tag::StVarSuper { name } => {
                let env = instr.args[1];
                match state.envs.parent_of(env) {
                    Some(parent) if state.envs.known(parent) => {
                        state.envs.env_mut(parent).set(*name, instr.args[0], id, 0, code);
                    }
                    _ => {
                        // The super-assign lands somewhere we cannot see
                        state.envs.taint_all();
                    }
                }
            }
            Tag::StaticCall { fun, .. } => {
                if let Some(env) = instr.env() {
                    state.envs.leak(env);
                }
                if self.callees.properties(*fun).contains(VersionProperties::NO_REFLECTION) {
                    state.envs.taint_leaked();
                } else {
                    state.envs.taint_all();
                }
            }
            Tag::Call { .. } | Tag::NamedCall { .. } => {
                if let Some(env) = instr.env() {
                    state.envs.leak(env);
                }
                state.envs.taint_all();
            }
            _ => {
                if instr.effects.contains(Effects::LEAKS_ENV) {
                    if let Some(env) = instr.env() {
                        state.envs.leak(env);
                    }
                }
                if instr.effects.taints_env() {
                    state.envs.taint_leaked();
                }
            }
        }
    }
}

/// The finished analysis: per-load results plus observed stores.
pub struct ScopeResults {
    pub loads: FxHashMap<InstrId, AbstractLoad>,
    pub observed_stores: FxHashSet<InstrId>,
    pub final_state: ScopeState,
}

impl ScopeResults {
    /// Whether an environment is leaked at function exit.
    pub fn leaked_at_exit(&self, env: Value) -> bool {
        self.final_state.envs.env(env).map(|e| e.leaked).unwrap_or(true)
    }
}

/// Run scope analysis over a code unit and collect its results.
pub fn analyze(code: &Code, callees: &dyn CalleeProperties) -> ScopeResults {
    let fp = FixedPoint::run(ScopeAnalysis::new(callees), code);

    let mut loads = FxHashMap::default();
    let mut observed_stores = FxHashSet::default();

    fp.foreach_before(code, |state, id| {
        let instr = code.instr(id);
        match &instr.tag {
            Tag::LdVar { name } | Tag::Missing { name } => {
                loads.insert(id, state.envs.get(instr.args[0], *name));
            }
            Tag::LdFun { name } => {
                loads.insert(id, state.envs.get_fun(instr.args[0], *name));
            }
            Tag::LdVarSuper { name } => {
                loads.insert(id, state.envs.super_get(instr.args[0], *name));
            }
            Tag::StVar { .. } => {
                let env = instr.args[1];
                let leaked = state.envs.env(env).map(|e| e.leaked).unwrap_or(true);
                if leaked {
                    observed_stores.insert(id);
                }
            }
            Tag::StVarSuper { .. } => {
                // The store lands on the parent environment
                let target = state.envs.parent_of(instr.args[1]);
                let leaked = match target {
                    Some(t) => state.envs.env(t).map(|e| e.leaked).unwrap_or(true),
                    None => true,
                };
                if leaked {
                    observed_stores.insert(id);
                }
            }
            _ => {}
        }
    });

    // Stores into environments leaked anywhere later are also observable;
    // approximate with the exit state
    let final_state = fp.exit().cloned().unwrap_or_default();
    collect_exit_observed_stores(code, &final_state, &mut observed_stores);

    ScopeResults { loads, observed_stores, final_state }
}

fn collect_exit_observed_stores(code: &Code, state: &ScopeState, observed: &mut FxHashSet<InstrId>) {
    crate::visitor::Visitor::run(code, |bb| {
        for id in &code.bb(bb).instrs {
            let instr = code.instr(*id);
            let target = match instr.tag {
                Tag::StVar { .. } => Some(instr.args[1]),
                Tag::StVarSuper { .. } => state.envs.parent_of(instr.args[1]),
                _ => continue,
            };
            let leaked = match target {
                Some(t) => state.envs.env(t).map(|e| e.leaked).unwrap_or(true),
                None => true,
            };
            if leaked {
                observed.insert(*id);
            }
        }
    });
}
