//! Redundant-load elision and dead-store removal.
//!
//! `LoadElision` forwards a binding load to an identical dominating load
//! when no store or taint can have intervened. `DeadStoreRemoval` is the
//! store half of scope resolution as a cheap standalone pass: stores to
//! environments nothing can observe are dropped.

use rustc_hash::FxHashMap;
use tarn_bytecode::Symbol;

use super::scope_resolution::ModuleCallees;
use super::{Pass, PassCtx};
use crate::analysis::framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
use crate::analysis::scope;
use crate::ir::code::Code;
use crate::ir::effects::Effects;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::ClosureVersion;

/// Known previous load per (environment, name).
#[derive(Debug, Clone, PartialEq, Default)]
struct KnownLoads {
    map: FxHashMap<(Value, Symbol), InstrId>,
}

impl AbstractState for KnownLoads {
    fn merge(&mut self, other: &Self) -> AbstractRes {
        let before = self.map.len();
        self.map.retain(|k, v| other.map.get(k) == Some(v));
        if self.map.len() != before {
            AbstractRes::Updated
        } else {
            AbstractRes::None
        }
    }
}

struct LoadAnalysis;

impl Analysis for LoadAnalysis {
    type State = KnownLoads;

    fn init(&self, _code: &Code) -> KnownLoads {
        KnownLoads::default()
    }

    fn apply(&self, state: &mut KnownLoads, code: &Code, id: InstrId) {
        let instr = code.instr(id);
        match &instr.tag {
            Tag::LdVar { name } => {
                state.map.insert((instr.args[0], *name), id);
            }
            Tag::StVar { name } => {
                // The binding changed; every cached load of it is stale
                let n = *name;
                state.map.retain(|(_, k), _| *k != n);
            }
            _ => {
                if instr.effects.intersects(Effects::WRITES_ENV | Effects::EXECUTES_CODE | Effects::REFLECTION)
                {
                    state.map.clear();
                }
            }
        }
    }

    fn segment_after(&self, _code: &Code, _id: InstrId) -> bool {
        false
    }
}

pub struct LoadElision;

impl Pass for LoadElision {
    fn name(&self) -> &'static str {
        "load-elision"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let fp = FixedPoint::run(LoadAnalysis, code);

        let mut redundant: Vec<(InstrId, InstrId)> = Vec::new();
        fp.foreach_before(code, |state, id| {
            if let Tag::LdVar { name } = code.instr(id).tag {
                let key = (code.instr(id).args[0], name);
                if let Some(prev) = state.map.get(&key) {
                    if *prev != id {
                        redundant.push((id, *prev));
                    }
                }
            }
        });

        let changed = !redundant.is_empty();
        for (load, prev) in redundant {
            code.replace_uses_with(load, Value::Instr(prev));
            code.remove_instr(load);
        }
        changed
    }
}

pub struct DeadStoreRemoval;

impl Pass for DeadStoreRemoval {
    fn name(&self) -> &'static str {
        "dead-store"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let callees = ModuleCallees(ctx.module);
        let code = &mut version.code;
        let results = scope::analyze(code, &callees);

        let mut dead: Vec<InstrId> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if let Tag::StVar { .. } = code.instr(*id).tag {
                    let env = code.instr(*id).args[1];
                    if !results.observed_stores.contains(id) && !results.leaked_at_exit(env) {
                        dead.push(*id);
                    }
                }
            }
        });
        let changed = !dead.is_empty();
        for id in dead {
            code.remove_instr(id);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::Formals;
    use tarn_bytecode::FunId;

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
    fn test_repeated_load_elided() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let l1 = b.add(Tag::LdVar { name: Symbol(7) }, vec![env]);
        let l2 = b.add(Tag::LdVar { name: Symbol(7) }, vec![env]);
        let sum = b.add(Tag::Add, vec![l1, l2, env]);
        b.add(Tag::Return, vec![sum]);

        assert!(run(&LoadElision, &mut v));
        let mut loads = 0;
        crate::visitor::Visitor::run(&v.code, |bb| {
            for id in &v.code.bb(bb).instrs {
                if matches!(v.code.instr(*id).tag, Tag::LdVar { .. }) {
                    loads += 1;
                }
            }
        });
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_store_between_loads_blocks_elision() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let l1 = b.add(Tag::LdVar { name: Symbol(7) }, vec![env]);
        b.add(Tag::StVar { name: Symbol(7) }, vec![Value::True, env]);
        let l2 = b.add(Tag::LdVar { name: Symbol(7) }, vec![env]);
        let sum = b.add(Tag::Add, vec![l1, l2, env]);
        b.add(Tag::Return, vec![sum]);

        assert!(!run(&LoadElision, &mut v));
    }

    #[test]
    fn test_dead_store_removed() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        b.add(Tag::StVar { name: Symbol(7) }, vec![Value::True, env]);
        b.add(Tag::Return, vec![Value::Nil]);

        assert!(run(&DeadStoreRemoval, &mut v));
        assert!(crate::query::no_store(&v, None));
    }
}
