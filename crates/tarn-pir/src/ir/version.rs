//! Closure versions and promises.
//!
//! A `ClosureVersion` is one compilation of a user closure under one
//! assumption context. It owns its body code and the promise code units the
//! body references. Promises deleted by passes are flagged, not compacted,
//! so `PromiseId`s stay stable. The promise pool is a separate field so the
//! lifter can grow it while it is emitting into the body.

use bitflags::bitflags;
use tarn_bytecode::context::Context;
use tarn_bytecode::module::{CodeRef, FunId};

use super::code::Code;
use super::value::PromiseId;

bitflags! {
    /// Facts about a version established by optimization, usable by callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VersionProperties: u8 {
        /// Evaluates all its arguments, in order, before anything else
        const IS_EAGER      = 1 << 0;
        /// Never inspects calling frames or environments reflectively
        const NO_REFLECTION = 1 << 1;
    }
}

/// A lazy argument's code, compiled to PIR.
#[derive(Debug, Clone)]
pub struct Promise {
    pub id: PromiseId,
    /// The baseline code this was compiled from
    pub bc: CodeRef,
    pub code: Code,
}

/// The promise slots of a version. Deletion flags a slot; ids are stable.
#[derive(Debug, Clone, Default)]
pub struct PromisePool {
    slots: Vec<Option<Promise>>,
}

impl PromisePool {
    pub fn create(&mut self, bc: CodeRef, code: Code) -> PromiseId {
        let id = PromiseId(self.slots.len() as u16);
        self.slots.push(Some(Promise { id, bc, code }));
        id
    }

    pub fn get(&self, id: PromiseId) -> Option<&Promise> {
        self.slots.get(id.0 as usize).and_then(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, id: PromiseId) -> Option<&mut Promise> {
        self.slots.get_mut(id.0 as usize).and_then(|p| p.as_mut())
    }

    pub fn delete(&mut self, id: PromiseId) {
        if let Some(slot) = self.slots.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn ids(&self) -> Vec<PromiseId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_some())
            .map(|(i, _)| PromiseId(i as u16))
            .collect()
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

/// One compilation of a closure under one context.
#[derive(Debug, Clone)]
pub struct ClosureVersion {
    pub fun: FunId,
    pub ctx: Context,
    pub code: Code,
    pub promises: PromisePool,
    pub properties: VersionProperties,
}

impl ClosureVersion {
    pub fn new(fun: FunId, ctx: Context) -> ClosureVersion {
        ClosureVersion {
            fun,
            ctx,
            code: Code::new(),
            promises: PromisePool::default(),
            properties: VersionProperties::empty(),
        }
    }

    pub fn create_promise(&mut self, bc: CodeRef, code: Code) -> PromiseId {
        self.promises.create(bc, code)
    }

    pub fn promise(&self, id: PromiseId) -> Option<&Promise> {
        self.promises.get(id)
    }

    pub fn promise_mut(&mut self, id: PromiseId) -> Option<&mut Promise> {
        self.promises.get_mut(id)
    }

    /// Flag a promise as deleted. Ids of the remaining promises are
    /// unchanged.
    pub fn delete_promise(&mut self, id: PromiseId) {
        self.promises.delete(id);
    }

    pub fn promise_ids(&self) -> Vec<PromiseId> {
        self.promises.ids()
    }

    pub fn num_promise_slots(&self) -> usize {
        self.promises.num_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_bytecode::module::WhichCode;

    #[test]
    fn test_promise_ids_stable_after_delete() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let r = CodeRef { fun: FunId(0), which: WhichCode::Promise(0) };
        let a = v.create_promise(r, Code::new());
        let b = v.create_promise(CodeRef { fun: FunId(0), which: WhichCode::Promise(1) }, Code::new());
        v.delete_promise(a);
        assert!(v.promise(a).is_none());
        assert!(v.promise(b).is_some());
        assert_eq!(v.promise_ids(), vec![b]);
        assert_eq!(v.num_promise_slots(), 2);
    }
}
