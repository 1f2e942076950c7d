//! The compiler-side module: every closure under compilation plus their
//! dispatch tables. Owned by the driver; single-threaded.

use rustc_hash::FxHashMap;
use tarn_bytecode::module::{Formals, FunId};

use super::closure::{Closure, ClosureId, VersionIdx};
use super::version::ClosureVersion;

#[derive(Debug, Default)]
pub struct Module {
    closures: Vec<Closure>,
    by_fun: FxHashMap<FunId, ClosureId>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    /// Get or declare the closure wrapping a baseline function.
    pub fn get_or_declare(&mut self, fun: FunId, name: &str, formals: Formals) -> ClosureId {
        if let Some(&id) = self.by_fun.get(&fun) {
            return id;
        }
        let id = ClosureId(self.closures.len() as u32);
        self.closures.push(Closure::new(id, fun, name.to_string(), formals));
        self.by_fun.insert(fun, id);
        id
    }

    pub fn closure_for_fun(&self, fun: FunId) -> Option<ClosureId> {
        self.by_fun.get(&fun).copied()
    }

    pub fn closure(&self, id: ClosureId) -> &Closure {
        &self.closures[id.0 as usize]
    }

    pub fn closure_mut(&mut self, id: ClosureId) -> &mut Closure {
        &mut self.closures[id.0 as usize]
    }

    pub fn num_closures(&self) -> usize {
        self.closures.len()
    }

    pub fn closure_ids(&self) -> impl Iterator<Item = ClosureId> {
        (0..self.closures.len() as u32).map(ClosureId)
    }

    /// Every (closure, version) pair currently in the module.
    pub fn all_versions(&self) -> Vec<(ClosureId, VersionIdx)> {
        let mut out = Vec::new();
        for id in self.closure_ids() {
            for idx in self.closure(id).dispatch.indices() {
                if self.closure(id).dispatch.version(idx).is_some() {
                    out.push((id, idx));
                }
            }
        }
        out
    }

    /// Take a version for exclusive mutation by a pass.
    pub fn take_version(&mut self, cls: ClosureId, idx: VersionIdx) -> Option<ClosureVersion> {
        self.closure_mut(cls).dispatch.take(idx)
    }

    pub fn put_version(&mut self, cls: ClosureId, idx: VersionIdx, version: ClosureVersion) {
        self.closure_mut(cls).dispatch.put(idx, version);
    }
}
