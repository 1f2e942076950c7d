//! Closures and dispatch tables.
//!
//! A `Closure` represents a user closure globally across all its compiled
//! versions. Versions are keyed by the context they were compiled under; the
//! table is append-only so the baseline dispatcher can index it without
//! synchronization.

use tarn_bytecode::context::Context;
use tarn_bytecode::module::{Formals, FunId, SrcIdx};

use super::version::ClosureVersion;

/// Id of a closure within the compiler's module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureId(pub u32);

/// Index into a closure's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionIdx(pub usize);

#[derive(Debug, Default)]
struct DispatchEntry {
    ctx: Context,
    /// None while a pass holds the version exclusively
    version: Option<ClosureVersion>,
}

/// Ordered, append-only list of compiled versions keyed by context.
#[derive(Debug, Default)]
pub struct DispatchTable {
    entries: Vec<DispatchEntry>,
}

impl DispatchTable {
    /// The best existing version whose compiled context is included in the
    /// caller's context. "Best" is the one assuming the most.
    pub fn find_compatible_version(&self, ctx: &Context) -> Option<VersionIdx> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| ctx.includes(&e.ctx))
            .max_by_key(|(_, e)| e.ctx.strength())
            .map(|(i, _)| VersionIdx(i))
    }

    /// A version compiled under exactly this context, if any.
    pub fn find_exact(&self, ctx: &Context) -> Option<VersionIdx> {
        self.entries.iter().position(|e| e.ctx == *ctx).map(VersionIdx)
    }

    /// Allocate a fresh version slot for a context.
    pub fn declare(&mut self, fun: FunId, ctx: Context) -> VersionIdx {
        let idx = VersionIdx(self.entries.len());
        self.entries.push(DispatchEntry { ctx, version: Some(ClosureVersion::new(fun, ctx)) });
        idx
    }

    pub fn context(&self, idx: VersionIdx) -> &Context {
        &self.entries[idx.0].ctx
    }

    pub fn version(&self, idx: VersionIdx) -> Option<&ClosureVersion> {
        self.entries[idx.0].version.as_ref()
    }

    pub fn version_mut(&mut self, idx: VersionIdx) -> Option<&mut ClosureVersion> {
        self.entries[idx.0].version.as_mut()
    }

    /// Take a version out for exclusive mutation; `put` it back after.
    pub fn take(&mut self, idx: VersionIdx) -> Option<ClosureVersion> {
        self.entries[idx.0].version.take()
    }

    pub fn put(&mut self, idx: VersionIdx, version: ClosureVersion) {
        debug_assert!(self.entries[idx.0].version.is_none());
        self.entries[idx.0].version = Some(version);
    }

    /// Discard a failed compilation.
    pub fn discard(&mut self, idx: VersionIdx) {
        self.entries[idx.0].version = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = VersionIdx> {
        (0..self.entries.len()).map(VersionIdx)
    }
}

/// A user closure known to the compiler.
#[derive(Debug)]
pub struct Closure {
    pub id: ClosureId,
    pub fun: FunId,
    pub name: String,
    pub formals: Formals,
    pub srcref: Option<SrcIdx>,
    pub dispatch: DispatchTable,
}

impl Closure {
    pub fn new(id: ClosureId, fun: FunId, name: String, formals: Formals) -> Closure {
        Closure { id, fun, name, formals, srcref: None, dispatch: DispatchTable::default() }
    }
}
