//! The optimization pipeline.
//!
//! Passes transform one `ClosureVersion` in place and report whether they
//! changed anything. The scheduler runs them in phases; each phase sweeps
//! its pass list until a full sweep changes nothing or the phase budget is
//! spent. Recursive compilation is never done inside a pass: passes enqueue
//! `CompileRequest`s and the driver drains them between passes.

pub mod assumptions;
pub mod cleanup;
pub mod constantfold;
pub mod contexts;
pub mod delay;
pub mod eager_calls;
pub mod elide_env;
pub mod elide_loads;
pub mod force_dominance;
pub mod gvn;
pub mod hoist;
pub mod inline;
pub mod match_call_args;
pub mod scope_resolution;
pub mod type_inference;
pub mod visibility;

use std::time::Instant;

use tarn_bytecode::module::{BcFunction, ConstPool};

use crate::config::CompilerConfig;
use crate::frontend::CompileRequest;
use crate::host::Host;
use crate::ir::module::Module;
use crate::ir::version::ClosureVersion;

/// Everything a pass may consult besides the version it owns. The version
/// under optimization has been taken out of the module, so lookups of other
/// closures cannot alias it.
pub struct PassCtx<'a> {
    pub module: &'a Module,
    pub functions: &'a [BcFunction],
    pub pool: &'a mut ConstPool,
    pub host: &'a dyn Host,
    pub config: &'a CompilerConfig,
    pub requests: &'a mut Vec<CompileRequest>,
}

pub trait Pass {
    fn name(&self) -> &'static str;

    /// Apply the pass; true when the version changed.
    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool;
}

struct Phase {
    name: &'static str,
    passes: Vec<Box<dyn Pass>>,
    budget: usize,
}

/// Per-pass wall-clock measurement, populated under `PIR_MEASURE_COMPILER`.
#[derive(Debug, Default)]
pub struct PassTimings {
    pub entries: Vec<(&'static str, std::time::Duration)>,
}

pub struct PassScheduler {
    phases: Vec<Phase>,
}

impl PassScheduler {
    /// The default pipeline. Blacklisted passes are not scheduled at all.
    pub fn default_pipeline(config: &CompilerConfig) -> PassScheduler {
        let mut scheduler = PassScheduler { phases: Vec::new() };
        let budget = config.phase_budget;

        let default_opt: &[fn() -> Box<dyn Pass>] = &[
            || Box::new(match_call_args::MatchCallArgs),
            || Box::new(eager_calls::EagerCalls),
            || Box::new(type_inference::TypeInference),
            || Box::new(inline::Inline),
            || Box::new(contexts::OptimizeContexts),
            || Box::new(force_dominance::ForceDominance),
            || Box::new(scope_resolution::ScopeResolution),
            || Box::new(elide_loads::LoadElision),
            || Box::new(gvn::Gvn),
            || Box::new(constantfold::Constantfold),
            || Box::new(elide_loads::DeadStoreRemoval),
            || Box::new(inline::Inline),
            || Box::new(contexts::OptimizeContexts),
            || Box::new(visibility::OptimizeVisibility),
            || Box::new(assumptions::OptimizeAssumptions),
            || Box::new(constantfold::Constantfold),
            || Box::new(cleanup::Cleanup),
            || Box::new(elide_env::ElideEnv),
            || Box::new(delay::DelayEnv),
            || Box::new(delay::DelayInstr),
            || Box::new(cleanup::Cleanup),
        ];
        let post_opt: &[fn() -> Box<dyn Pass>] = &[
            || Box::new(hoist::HoistInstruction),
            || Box::new(hoist::LoopInvariant),
            || Box::new(hoist::Overflow),
            || Box::new(type_inference::TypeInference),
        ];

        let add = |scheduler: &mut PassScheduler, factories: &[fn() -> Box<dyn Pass>]| {
            for f in factories {
                let pass = f();
                if !config.pass_disabled(pass.name()) {
                    scheduler.phases.last_mut().unwrap().passes.push(pass);
                }
            }
        };

        scheduler.next_phase("initial", budget * 2);
        add(&mut scheduler, default_opt);
        scheduler.next_phase("initial post", budget);
        add(&mut scheduler, post_opt);

        // Speculate only after the static passes had their chance
        scheduler.next_phase("speculation", budget * 3);
        if !config.pass_disabled("elide-env-spec") {
            scheduler
                .phases
                .last_mut()
                .unwrap()
                .passes
                .push(Box::new(elide_env::ElideEnvSpec));
        }
        add(&mut scheduler, default_opt);
        if !config.pass_disabled("type-speculation") {
            scheduler
                .phases
                .last_mut()
                .unwrap()
                .passes
                .push(Box::new(type_inference::TypeSpeculation));
        }
        scheduler.next_phase("speculation post", budget);
        add(&mut scheduler, post_opt);

        // Unused checkpoints keep values alive; drop them, then re-run
        scheduler.next_phase("remove cp", budget);
        if !config.pass_disabled("cleanup-checkpoints") {
            scheduler
                .phases
                .last_mut()
                .unwrap()
                .passes
                .push(Box::new(cleanup::CleanupCheckpoints));
        }
        add(&mut scheduler, post_opt);

        scheduler.next_phase("intermediate", budget * 2);
        add(&mut scheduler, default_opt);

        // After this, calls no longer hold frame states and no new
        // assumptions can be introduced
        scheduler.next_phase("cleanup fs", budget);
        for pass in [
            Box::new(cleanup::CleanupFramestate) as Box<dyn Pass>,
            Box::new(cleanup::CleanupCheckpoints),
        ] {
            if !config.pass_disabled(pass.name()) {
                scheduler.phases.last_mut().unwrap().passes.push(pass);
            }
        }

        scheduler.next_phase("final", budget * 3);
        add(&mut scheduler, default_opt);
        for pass in [
            Box::new(elide_env::ElideEnvSpec) as Box<dyn Pass>,
            Box::new(cleanup::CleanupCheckpoints),
        ] {
            if !config.pass_disabled(pass.name()) {
                scheduler.phases.last_mut().unwrap().passes.push(pass);
            }
        }

        scheduler.next_phase("final post", budget);
        add(&mut scheduler, post_opt);
        for pass in [
            Box::new(cleanup::Cleanup) as Box<dyn Pass>,
            Box::new(cleanup::CleanupCheckpoints),
            Box::new(cleanup::Cleanup),
        ] {
            if !config.pass_disabled(pass.name()) {
                scheduler.phases.last_mut().unwrap().passes.push(pass);
            }
        }

        scheduler
    }

    fn next_phase(&mut self, name: &'static str, budget: usize) {
        self.phases.push(Phase { name, passes: Vec::new(), budget });
    }

    /// Run every phase over one version. The caller drains `ctx.requests`
    /// afterwards (and may call this again for freshly compiled callees).
    pub fn run(
        &self,
        version: &mut ClosureVersion,
        ctx: &mut PassCtx,
        timings: &mut PassTimings,
    ) {
        for phase in &self.phases {
            let mut applications = 0;
            loop {
                let mut changed = false;
                for pass in &phase.passes {
                    if applications >= phase.budget {
                        break;
                    }
                    applications += 1;
                    let start = ctx.config.measure.then(Instant::now);
                    if pass.run(version, ctx) {
                        changed = true;
                        version.code.gc();
                    }
                    if let Some(start) = start {
                        timings.entries.push((pass.name(), start.elapsed()));
                    }
                    debug_assert!(
                        crate::ir::verify::verify(version).is_ok(),
                        "verifier failed after {} in phase {}: {:?}",
                        pass.name(),
                        phase.name,
                        crate::ir::verify::verify(version)
                    );
                }
                if !changed || applications >= phase.budget {
                    break;
                }
            }
        }
    }
}
