//! Abstract values and abstract environments for scope analysis.
//!
//! An abstract value is the set of SSA values a binding may hold, each
//! remembered with the instruction that defined it and the inlining recursion
//! level it came from. "Unknown" is the top of the lattice. An abstract
//! environment additionally tracks whether it has leaked (become visible to
//! code we cannot analyze) and whether it was tainted wholesale.

use rustc_hash::FxHashMap;
use tarn_bytecode::symbols::Symbol;

use super::framework::AbstractRes;
use crate::ir::code::Code;
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};

/// One possible source of a binding's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValOrig {
    pub val: Value,
    pub origin: InstrId,
    pub recursion: u32,
}

/// A set of possible values, or unknown.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbstractValue {
    vals: Vec<ValOrig>,
    unknown: bool,
    pub ty: PirType,
}

impl AbstractValue {
    pub fn of(val: Value, origin: InstrId, recursion: u32, code: &Code) -> AbstractValue {
        AbstractValue {
            vals: vec![ValOrig { val, origin, recursion }],
            unknown: false,
            ty: val.ty(code),
        }
    }

    pub fn tainted() -> AbstractValue {
        AbstractValue { vals: Vec::new(), unknown: true, ty: PirType::any() }
    }

    pub fn taint(&mut self) {
        self.vals.clear();
        self.unknown = true;
        self.ty = PirType::any();
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    pub fn is_single_value(&self) -> bool {
        !self.unknown && self.vals.len() == 1
    }

    pub fn single_value(&self) -> Option<&ValOrig> {
        if self.is_single_value() {
            self.vals.first()
        } else {
            None
        }
    }

    pub fn sources(&self) -> &[ValOrig] {
        &self.vals
    }

    pub fn merge(&mut self, other: &AbstractValue) -> AbstractRes {
        if self.unknown {
            return AbstractRes::None;
        }
        if other.unknown {
            self.taint();
            return AbstractRes::Tainted;
        }
        let mut res = AbstractRes::None;
        for v in &other.vals {
            if !self.vals.contains(v) {
                self.vals.push(v.clone());
                res = AbstractRes::Updated;
            }
        }
        if self.ty.merge(&other.ty) {
            res = res.max(AbstractRes::Updated);
        }
        self.vals.sort();
        res
    }
}

/// A static approximation of one runtime environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbstractEnv {
    pub entries: FxHashMap<Symbol, AbstractValue>,
    pub parent: Option<Value>,
    pub leaked: bool,
    pub tainted: bool,
}

impl AbstractEnv {
    pub fn taint(&mut self) {
        self.tainted = true;
        for v in self.entries.values_mut() {
            v.taint();
        }
    }

    pub fn set(&mut self, name: Symbol, val: Value, origin: InstrId, recursion: u32, code: &Code) {
        self.entries.insert(name, AbstractValue::of(val, origin, recursion, code));
    }

    pub fn get(&self, name: Symbol) -> AbstractValue {
        match self.entries.get(&name) {
            Some(v) => v.clone(),
            None if self.tainted => AbstractValue::tainted(),
            // No binding recorded: the name may still exist in the concrete
            // environment (e.g. written before analysis precision was lost)
            None => AbstractValue::tainted(),
        }
    }

    /// Whether the binding is definitely absent here (lookup continues in
    /// the parent).
    pub fn absent(&self, name: Symbol) -> bool {
        !self.tainted && !self.entries.contains_key(&name)
    }

    pub fn merge(&mut self, other: &AbstractEnv) -> AbstractRes {
        let mut res = AbstractRes::None;
        if !self.leaked && other.leaked {
            self.leaked = true;
            res = res.max(AbstractRes::LostPrecision);
        }
        if !self.tainted && other.tainted {
            self.taint();
            res = res.max(AbstractRes::Tainted);
        }
        for (name, val) in &other.entries {
            match self.entries.get_mut(name) {
                Some(mine) => {
                    res = res.max(mine.merge(val));
                }
                None => {
                    self.entries.insert(*name, AbstractValue::tainted());
                    res = res.max(AbstractRes::LostPrecision);
                }
            }
        }
        let missing: Vec<Symbol> = self
            .entries
            .iter()
            .filter(|(n, v)| !other.entries.contains_key(n) && !v.is_unknown())
            .map(|(n, _)| *n)
            .collect();
        for name in missing {
            self.entries.get_mut(&name).unwrap().taint();
            res = res.max(AbstractRes::LostPrecision);
        }
        match (&self.parent, &other.parent) {
            (None, Some(p)) => {
                self.parent = Some(*p);
                res = res.max(AbstractRes::Updated);
            }
            (Some(a), Some(b)) if a != b => {
                self.parent = None;
                res = res.max(AbstractRes::LostPrecision);
            }
            _ => {}
        }
        res
    }
}

/// Result of an abstract load: the defining environment plus the value.
#[derive(Debug, Clone)]
pub struct AbstractLoad {
    /// The environment the binding was found in; None when unknown
    pub env: Option<Value>,
    pub result: AbstractValue,
}

impl AbstractLoad {
    pub fn unknown() -> AbstractLoad {
        AbstractLoad { env: None, result: AbstractValue::tainted() }
    }
}

/// All environments the analysis knows about, plus aliasing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AbstractHierarchy {
    envs: FxHashMap<Value, AbstractEnv>,
    pub aliases: FxHashMap<Value, Value>,
}

impl AbstractHierarchy {
    fn resolve(&self, env: Value) -> Value {
        self.aliases.get(&env).copied().unwrap_or(env)
    }

    pub fn known(&self, env: Value) -> bool {
        self.envs.contains_key(&self.resolve(env))
    }

    pub fn env(&self, env: Value) -> Option<&AbstractEnv> {
        self.envs.get(&self.resolve(env))
    }

    pub fn env_mut(&mut self, env: Value) -> &mut AbstractEnv {
        let key = self.resolve(env);
        self.envs.entry(key).or_default()
    }

    pub fn all_envs(&self) -> impl Iterator<Item = (&Value, &AbstractEnv)> {
        self.envs.iter()
    }

    pub fn taint_all(&mut self) {
        for env in self.envs.values_mut() {
            env.taint();
        }
    }

    pub fn taint_leaked(&mut self) {
        for env in self.envs.values_mut() {
            if env.leaked {
                env.taint();
            }
        }
    }

    pub fn leak(&mut self, env: Value) {
        self.env_mut(env).leaked = true;
    }

    /// Walk the abstract parent chain for a binding.
    pub fn get(&self, env: Value, name: Symbol) -> AbstractLoad {
        let mut cur = self.resolve(env);
        loop {
            let Some(e) = self.envs.get(&cur) else { return AbstractLoad::unknown() };
            if e.absent(name) {
                match e.parent {
                    Some(p) => {
                        cur = self.resolve(p);
                        continue;
                    }
                    None => return AbstractLoad::unknown(),
                }
            }
            let result = e.get(name);
            if result.is_unknown() {
                return AbstractLoad::unknown();
            }
            return AbstractLoad { env: Some(cur), result };
        }
    }

    /// Function-position lookup: skip bindings that are definitely not
    /// closures, matching the host's semantics.
    pub fn get_fun(&self, env: Value, name: Symbol) -> AbstractLoad {
        let mut cur = self.resolve(env);
        loop {
            let Some(e) = self.envs.get(&cur) else { return AbstractLoad::unknown() };
            if !e.absent(name) {
                let result = e.get(name);
                if result.is_unknown() {
                    return AbstractLoad::unknown();
                }
                if result.ty.maybe(crate::ir::ty::RTypeSet::CLO)
                    || result.ty.maybe_lazy()
                    || result.ty.maybe_promise_wrapped()
                {
                    return AbstractLoad { env: Some(cur), result };
                }
                // Definitely not a closure: lookup continues
            }
            match e.parent {
                Some(p) => cur = self.resolve(p),
                None => return AbstractLoad::unknown(),
            }
        }
    }

    /// Load from the parent of `env`.
    pub fn super_get(&self, env: Value, name: Symbol) -> AbstractLoad {
        match self.env(env).and_then(|e| e.parent) {
            Some(p) => self.get(p, name),
            None => AbstractLoad::unknown(),
        }
    }

    /// The known parent of an environment.
    pub fn parent_of(&self, env: Value) -> Option<Value> {
        self.env(env).and_then(|e| e.parent)
    }

    pub fn merge(&mut self, other: &AbstractHierarchy) -> AbstractRes {
        let mut res = AbstractRes::None;
        for (env, e) in &other.envs {
            match self.envs.get_mut(env) {
                Some(mine) => res = res.max(mine.merge(e)),
                None => {
                    self.envs.insert(*env, e.clone());
                    res = res.max(AbstractRes::Updated);
                }
            }
        }
        for (from, to) in &other.aliases {
            if !self.aliases.contains_key(from) {
                self.aliases.insert(*from, *to);
                res = res.max(AbstractRes::Updated);
            }
        }
        res
    }
}
