//! The compilation driver.
//!
//! Owns the module under compilation, the pass scheduler, and the deferred
//! worklist. Passes never compile recursively; they enqueue requests that
//! the driver drains between optimization runs, so a pass can never observe
//! another version half-built. Failures surface as errors here; a closure
//! that failed for a context-independent reason is marked unoptimizable and
//! never retried.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use thiserror::Error;

use tarn_bytecode::context::{Assumptions, Context};
use tarn_bytecode::module::{BcCode, BcModule, FunId};

use crate::backend::{self, LowerError};
use crate::config::{CompilerConfig, EnableMode};
use crate::frontend::{lift_function, CompileRequest, LiftError};
use crate::host::Host;
use crate::ir::closure::{ClosureId, VersionIdx};
use crate::ir::effects::Effects;
use crate::ir::module::Module;
use crate::ir::tag::Tag;
use crate::ir::verify;
use crate::ir::version::VersionProperties;
use crate::opt::{PassCtx, PassScheduler, PassTimings};
use crate::query::{self, CheckProperty};
use crate::visitor::Visitor;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation is disabled")]
    Disabled,
    #[error("closure was marked unoptimizable")]
    Unoptimizable,
    #[error("caller context misses the minimal assumptions")]
    InsufficientContext,
    #[error("cannot compile functions with dots formals")]
    DotsFormals,
    #[error("default arguments need a context that rules out missing ones")]
    DefaultArgs,
    #[error("baseline function exceeds the input size limit")]
    TooLarge,
    #[error(transparent)]
    Lift(#[from] LiftError),
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error("post-pass verification failed: {0}")]
    Verify(crate::ir::verify::VerifyError),
}

/// A compiled, installed version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRef {
    pub closure: ClosureId,
    pub version: VersionIdx,
}

pub struct Compiler<'a> {
    bc: &'a mut BcModule,
    host: &'a dyn Host,
    config: CompilerConfig,
    scheduler: PassScheduler,
    module: Module,
    timings: PassTimings,
    worklist: VecDeque<CompileRequest>,
    in_flight: FxHashSet<(FunId, Context)>,
}

impl<'a> Compiler<'a> {
    pub fn new(bc: &'a mut BcModule, host: &'a dyn Host, config: CompilerConfig) -> Compiler<'a> {
        let scheduler = PassScheduler::default_pipeline(&config);
        Compiler {
            bc,
            host,
            config,
            scheduler,
            module: Module::new(),
            timings: PassTimings::default(),
            worklist: VecDeque::new(),
            in_flight: FxHashSet::default(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn timings(&self) -> &PassTimings {
        &self.timings
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile a closure under a caller context, returning the installed
    /// version. The whole deferred worklist is drained before optimization,
    /// so inner closures get compiled (and are inlinable) in one step.
    pub fn compile_closure(&mut self, fun: FunId, ctx: Context) -> Result<VersionRef, CompileError> {
        if self.config.enable == EnableMode::Off {
            return Err(CompileError::Disabled);
        }
        if let Some(existing) = self.find_existing(fun, &ctx) {
            return Ok(existing);
        }

        let root = self.declare_and_lift(fun, ctx)?;
        let mut created = vec![root];

        // Drain the deferred requests; each may discover more
        while let Some(req) = self.worklist.pop_front() {
            if self.find_existing(req.fun, &req.ctx).is_some() {
                continue;
            }
            match self.declare_and_lift(req.fun, req.ctx) {
                Ok(v) => created.push(v),
                // Inner closures that cannot compile keep their generic
                // calls; the outer compilation proceeds
                Err(_) => {}
            }
        }

        // Optimize callees before callers so properties and bodies are
        // available to the inliner
        for v in created.iter().rev() {
            self.optimize_version(*v)?;
        }

        if self.config.enable == EnableMode::ForceDryRun {
            for v in &created {
                self.module.closure_mut(v.closure).dispatch.discard(v.version);
            }
        }
        Ok(root)
    }

    /// Compile a raw baseline function (no host closure needed).
    pub fn compile_function(&mut self, fun: FunId, ctx: Context) -> Result<VersionRef, CompileError> {
        self.compile_closure(fun, ctx)
    }

    /// Run the pass pipeline over every version currently in the module.
    pub fn optimize_module(&mut self) -> Result<(), CompileError> {
        for (cls, idx) in self.module.all_versions() {
            self.optimize_version(VersionRef { closure: cls, version: idx })?;
        }
        Ok(())
    }

    /// Lower an optimized version to baseline-compatible bytecode.
    pub fn lower(&mut self, version: VersionRef) -> Result<BcCode, CompileError> {
        let v = self
            .module
            .closure(version.closure)
            .dispatch
            .version(version.version)
            .ok_or(CompileError::Unoptimizable)?;
        Ok(backend::lower(v, &mut self.bc.pool, &self.config)?)
    }

    /// Compile and lower in one step.
    pub fn compile(&mut self, fun: FunId, ctx: Context) -> Result<(VersionRef, BcCode), CompileError> {
        let version = self.compile_closure(fun, ctx)?;
        let code = self.lower(version)?;
        Ok((version, code))
    }

    /// Test-only: compile under the given context and assert properties on
    /// the optimized version.
    pub fn pir_check(
        &mut self,
        fun: FunId,
        ctx: Context,
        properties: &[CheckProperty],
    ) -> Result<bool, CompileError> {
        let vr = self.compile_closure(fun, ctx)?;
        let version = self
            .module
            .closure(vr.closure)
            .dispatch
            .version(vr.version)
            .ok_or(CompileError::Unoptimizable)?;
        Ok(properties.iter().all(|p| query::check(version, *p)))
    }

    fn find_existing(&self, fun: FunId, ctx: &Context) -> Option<VersionRef> {
        let cls = self.module.closure_for_fun(fun)?;
        let idx = self.module.closure(cls).dispatch.find_compatible_version(ctx)?;
        self.module.closure(cls).dispatch.version(idx)?;
        Some(VersionRef { closure: cls, version: idx })
    }

    fn declare_and_lift(&mut self, fun: FunId, ctx: Context) -> Result<VersionRef, CompileError> {
        if !self.in_flight.insert((fun, ctx)) {
            return Err(CompileError::Unoptimizable);
        }

        let bc_fun = &self.bc.functions[fun.0 as usize];
        if bc_fun.unoptimizable {
            return Err(CompileError::Unoptimizable);
        }
        if !ctx.includes(&Context::minimal()) && ctx != Context::minimal() {
            return Err(CompileError::InsufficientContext);
        }
        if bc_fun.formals.has_dots() {
            self.bc.functions[fun.0 as usize].unoptimizable = true;
            return Err(CompileError::DotsFormals);
        }
        if bc_fun.formals.has_defaults()
            && !ctx.flags.contains(
                Assumptions::NO_EXPLICITLY_MISSING_ARGS | Assumptions::NOT_TOO_FEW_ARGUMENTS,
            )
        {
            // Context-dependent failure: a stronger caller may succeed
            return Err(CompileError::DefaultArgs);
        }
        if bc_fun.body.size() > self.config.max_input_size {
            self.bc.functions[fun.0 as usize].unoptimizable = true;
            return Err(CompileError::TooLarge);
        }

        let name = bc_fun.name.clone();
        let formals = bc_fun.formals.clone();
        let cls = self.module.get_or_declare(fun, &name, formals);
        let idx = self.module.closure_mut(cls).dispatch.declare(fun, ctx);

        let mut version = self.module.take_version(cls, idx).unwrap();
        let BcModule { functions, pool, .. } = &mut *self.bc;
        let lifted = lift_function(functions, pool, fun, &mut version);
        match lifted {
            Ok(requests) => {
                self.module.put_version(cls, idx, version);
                self.worklist.extend(requests);
                Ok(VersionRef { closure: cls, version: idx })
            }
            Err(err) => {
                self.module.closure_mut(cls).dispatch.discard(idx);
                self.bc.functions[fun.0 as usize].unoptimizable = true;
                Err(err.into())
            }
        }
    }

    fn optimize_version(&mut self, vr: VersionRef) -> Result<(), CompileError> {
        let Some(mut version) = self.module.take_version(vr.closure, vr.version) else {
            return Ok(());
        };

        let mut requests = Vec::new();
        {
            let BcModule { functions, pool, .. } = &mut *self.bc;
            let mut ctx = PassCtx {
                module: &self.module,
                functions,
                pool,
                host: self.host,
                config: &self.config,
                requests: &mut requests,
            };
            self.scheduler.run(&mut version, &mut ctx, &mut self.timings);
        }

        if let Err(err) = verify::verify(&version) {
            // A verifier failure is an internal error; in release the
            // version is discarded and the closure falls back to baseline
            debug_assert!(false, "verifier failure after optimization: {err}");
            self.module.closure_mut(vr.closure).dispatch.discard(vr.version);
            return Err(CompileError::Verify(err));
        }

        version.properties = compute_properties(&version);
        self.module.put_version(vr.closure, vr.version, version);

        // Requests found during optimization (sharper contexts) are only
        // compiled lazily on the next driver entry
        self.worklist.extend(requests);
        Ok(())
    }
}

/// Facts about the optimized body that callers may rely on.
fn compute_properties(version: &crate::ir::version::ClosureVersion) -> VersionProperties {
    let mut props = VersionProperties::NO_REFLECTION | VersionProperties::IS_EAGER;
    let code = &version.code;
    Visitor::run(code, |bb| {
        for id in &code.bb(bb).instrs {
            let instr = code.instr(*id);
            if instr.effects.contains(Effects::REFLECTION)
                || matches!(instr.tag, Tag::Call { .. } | Tag::NamedCall { .. })
            {
                props -= VersionProperties::NO_REFLECTION;
            }
            // A lazy argument that survived optimization means evaluation
            // order is observable
            if let Tag::MkArg { .. } = instr.tag {
                if instr.args[0] == crate::ir::value::Value::Missing {
                    props -= VersionProperties::IS_EAGER;
                }
            }
            if matches!(instr.tag, Tag::Force { .. }) && instr.args[0].ty(code).maybe_lazy() {
                props -= VersionProperties::IS_EAGER;
            }
        }
    });
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NativeHost;
    use tarn_bytecode::encoder::BcBuilder;
    use tarn_bytecode::module::{BcFunction, Formals};
    use tarn_bytecode::value::BcValue;
    use tarn_bytecode::Opcode;

    fn const_fn_module() -> (BcModule, FunId) {
        let mut module = BcModule::new("m");
        let mut b = BcBuilder::new();
        let c = module.pool.insert(BcValue::Int(42));
        b.push_const(c);
        b.op(Opcode::Ret);
        let fun = module.add_function(BcFunction {
            name: "f".into(),
            formals: Formals::default(),
            body: b.finish().unwrap(),
            ..Default::default()
        });
        (module, fun)
    }

    #[test]
    fn test_compile_and_dedup() {
        let (mut bc, fun) = const_fn_module();
        let host = NativeHost;
        let mut compiler = Compiler::new(&mut bc, &host, CompilerConfig::default());

        let a = compiler.compile_closure(fun, Context::minimal()).unwrap();
        let b = compiler.compile_closure(fun, Context::minimal()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_disabled_mode() {
        let (mut bc, fun) = const_fn_module();
        let host = NativeHost;
        let config = CompilerConfig { enable: EnableMode::Off, ..Default::default() };
        let mut compiler = Compiler::new(&mut bc, &host, config);
        assert!(matches!(
            compiler.compile_closure(fun, Context::minimal()),
            Err(CompileError::Disabled)
        ));
    }

    #[test]
    fn test_dots_formals_rejected_and_sticky() {
        let mut bc = BcModule::new("m");
        let dots = Formals::new(vec![tarn_bytecode::Symbol::DOTS]);
        let mut b = BcBuilder::new();
        let c = bc.pool.insert(BcValue::Nil);
        b.push_const(c);
        b.op(Opcode::Ret);
        let fun = bc.add_function(BcFunction {
            name: "f".into(),
            formals: dots,
            body: b.finish().unwrap(),
            ..Default::default()
        });

        let host = NativeHost;
        let mut compiler = Compiler::new(&mut bc, &host, CompilerConfig::default());
        assert!(matches!(
            compiler.compile_closure(fun, Context::minimal()),
            Err(CompileError::DotsFormals)
        ));
        // Marked unoptimizable; the retry reports that instead
        assert!(matches!(
            compiler.compile_closure(fun, Context::minimal()),
            Err(CompileError::Unoptimizable)
        ));
    }

    #[test]
    fn test_too_large_rejected() {
        let mut bc = BcModule::new("m");
        let mut b = BcBuilder::new();
        let c = bc.pool.insert(BcValue::Nil);
        for _ in 0..100 {
            b.push_const(c);
            b.op(Opcode::Pop);
        }
        b.push_const(c);
        b.op(Opcode::Ret);
        let fun = bc.add_function(BcFunction {
            name: "f".into(),
            formals: Formals::default(),
            body: b.finish().unwrap(),
            ..Default::default()
        });

        let host = NativeHost;
        let config = CompilerConfig { max_input_size: 64, ..Default::default() };
        let mut compiler = Compiler::new(&mut bc, &host, config);
        assert!(matches!(
            compiler.compile_closure(fun, Context::minimal()),
            Err(CompileError::TooLarge)
        ));
    }

    #[test]
    fn test_constant_function_optimizes_to_no_env() {
        let (mut bc, fun) = const_fn_module();
        let host = NativeHost;
        let mut compiler = Compiler::new(&mut bc, &host, CompilerConfig::default());
        let ok = compiler
            .pir_check(fun, Context::minimal(), &[CheckProperty::NoEnv, CheckProperty::NoLoad])
            .unwrap();
        assert!(ok);
    }
}
