//! Code objects, functions, and modules for the baseline tier.
//!
//! A `BcCode` is a linear opcode stream plus the side tables the stream
//! indexes into: sources, call sites, environment name lists, feedback slots,
//! and deopt metadata. Functions own their promise code objects in a flat
//! pool so any code in the function (body or promise) can be named by a
//! `WhichCode`.

use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackSlot;
use crate::symbols::{Symbol, SymbolTable};
use crate::value::BcValue;

/// Index into the module's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunId(pub u32);

/// Index into the module's source (AST) pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrcIdx(pub u32);

/// Index into the module's constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolIdx(pub u32);

/// Which code object of a function: its body or one of its promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WhichCode {
    Body,
    Promise(u16),
}

/// A code object of a specific function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRef {
    pub fun: FunId,
    pub which: WhichCode,
}

/// Call metadata referenced by `Call` / `NamedCall` operands.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub nargs: u16,
    /// One entry per argument; None for positional arguments
    pub names: Vec<Option<Symbol>>,
    /// Source of the whole call expression
    pub src: Option<SrcIdx>,
    /// Assumption context the call was specialized under; the dispatcher
    /// uses it to pick a callee version (lowered code only)
    pub ctx: Option<crate::context::Context>,
}

impl CallSite {
    pub fn positional(nargs: u16) -> CallSite {
        CallSite { nargs, names: vec![None; nargs as usize], src: None, ctx: None }
    }

    pub fn has_names(&self) -> bool {
        self.names.iter().any(|n| n.is_some())
    }
}

/// One frame of a deopt target: where in which baseline code to resume and
/// how deep the operand stack is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeoptFrame {
    pub code: CodeRef,
    pub pc: u32,
    pub stack_depth: u32,
}

/// Metadata record for one `Deopt` site. Frames are ordered outermost caller
/// first; the interpreter rebuilds them in that order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeoptMetadata {
    pub frames: Vec<DeoptFrame>,
}

/// A linear bytecode stream with its side tables.
#[derive(Debug, Clone, Default)]
pub struct BcCode {
    pub code: Vec<u8>,
    /// pc → source index, sorted by pc
    pub srcs: Vec<(u32, SrcIdx)>,
    pub call_sites: Vec<CallSite>,
    /// Name lists for `MkEnv`
    pub name_lists: Vec<Vec<Symbol>>,
    pub feedback: Vec<FeedbackSlot>,
    pub deopts: Vec<DeoptMetadata>,
    /// Declared number of local slots (lowered code only)
    pub num_locals: u16,
}

impl BcCode {
    pub fn new() -> BcCode {
        BcCode::default()
    }

    /// Source index covering the given pc, if recorded.
    pub fn src_at(&self, pc: u32) -> Option<SrcIdx> {
        match self.srcs.binary_search_by_key(&pc, |(p, _)| *p) {
            Ok(i) => Some(self.srcs[i].1),
            Err(0) => None,
            Err(i) => Some(self.srcs[i - 1].1),
        }
    }

    pub fn call_site(&self, idx: u16) -> &CallSite {
        &self.call_sites[idx as usize]
    }

    pub fn size(&self) -> usize {
        self.code.len()
    }
}

/// A function's formal parameters.
#[derive(Debug, Clone, Default)]
pub struct Formals {
    pub names: Vec<Symbol>,
    /// Default-argument bodies, indexed like `names`
    pub defaults: Vec<Option<SrcIdx>>,
}

impl Formals {
    pub fn new(names: Vec<Symbol>) -> Formals {
        let defaults = vec![None; names.len()];
        Formals { names, defaults }
    }

    pub fn num_args(&self) -> usize {
        self.names.len()
    }

    pub fn has_dots(&self) -> bool {
        self.names.contains(&Symbol::DOTS)
    }

    pub fn has_defaults(&self) -> bool {
        self.defaults.iter().any(|d| d.is_some())
    }

    /// Formal slot of a name, if present.
    pub fn position(&self, name: Symbol) -> Option<usize> {
        self.names.iter().position(|n| *n == name)
    }
}

/// A baseline function: formals, body, and a flat pool of promise code
/// objects the body (and nested promises) reference by index.
#[derive(Debug, Clone, Default)]
pub struct BcFunction {
    pub name: String,
    pub formals: Formals,
    pub body: BcCode,
    pub promises: Vec<BcCode>,
    pub srcref: Option<SrcIdx>,
    /// Set when the optimizer gave up on this function; never retried
    pub unoptimizable: bool,
}

impl BcFunction {
    pub fn code(&self, which: WhichCode) -> &BcCode {
        match which {
            WhichCode::Body => &self.body,
            WhichCode::Promise(i) => &self.promises[i as usize],
        }
    }

    pub fn code_mut(&mut self, which: WhichCode) -> &mut BcCode {
        match which {
            WhichCode::Body => &mut self.body,
            WhichCode::Promise(i) => &mut self.promises[i as usize],
        }
    }
}

/// Constant pool with idempotent insertion.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    values: Vec<BcValue>,
}

impl ConstPool {
    pub fn new() -> ConstPool {
        ConstPool::default()
    }

    /// Insert a value, returning the existing index if an identical value is
    /// already pooled.
    pub fn insert(&mut self, value: BcValue) -> PoolIdx {
        if let Some(i) = self.values.iter().position(|v| v.identical(&value)) {
            return PoolIdx(i as u32);
        }
        let idx = PoolIdx(self.values.len() as u32);
        self.values.push(value);
        idx
    }

    pub fn get(&self, idx: PoolIdx) -> &BcValue {
        &self.values[idx.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Module metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMeta {
    pub name: String,
    pub source_file: Option<String>,
}

impl ModuleMeta {
    /// JSON form, for build tooling and debug dumps.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Option<ModuleMeta> {
        serde_json::from_str(json).ok()
    }
}

/// A baseline module: functions, shared pools, and interned symbols.
#[derive(Debug, Clone, Default)]
pub struct BcModule {
    pub meta: ModuleMeta,
    pub functions: Vec<BcFunction>,
    pub pool: ConstPool,
    pub symbols: SymbolTable,
    /// Number of entries in the source pool (sources themselves are host
    /// objects; the compiler only moves indices around)
    pub num_srcs: u32,
}

impl BcModule {
    pub fn new(name: &str) -> BcModule {
        BcModule {
            meta: ModuleMeta { name: name.to_string(), source_file: None },
            functions: Vec::new(),
            pool: ConstPool::new(),
            symbols: SymbolTable::new(),
            num_srcs: 0,
        }
    }

    pub fn add_function(&mut self, fun: BcFunction) -> FunId {
        let id = FunId(self.functions.len() as u32);
        self.functions.push(fun);
        id
    }

    pub fn function(&self, id: FunId) -> &BcFunction {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunId) -> &mut BcFunction {
        &mut self.functions[id.0 as usize]
    }

    pub fn code(&self, r: CodeRef) -> &BcCode {
        self.function(r.fun).code(r.which)
    }

    /// Allocate a fresh source-pool slot.
    pub fn add_src(&mut self) -> SrcIdx {
        let idx = SrcIdx(self.num_srcs);
        self.num_srcs += 1;
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_pool_idempotent() {
        let mut pool = ConstPool::new();
        let a = pool.insert(BcValue::Int(42));
        let b = pool.insert(BcValue::Int(42));
        let c = pool.insert(BcValue::Int(43));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a), &BcValue::Int(42));
    }

    #[test]
    fn test_src_at_covers_ranges() {
        let mut code = BcCode::new();
        code.srcs = vec![(0, SrcIdx(10)), (6, SrcIdx(11)), (14, SrcIdx(12))];
        assert_eq!(code.src_at(0), Some(SrcIdx(10)));
        assert_eq!(code.src_at(3), Some(SrcIdx(10)));
        assert_eq!(code.src_at(6), Some(SrcIdx(11)));
        assert_eq!(code.src_at(100), Some(SrcIdx(12)));
    }

    #[test]
    fn test_formals() {
        let f = Formals::new(vec![Symbol(10), Symbol::DOTS, Symbol(11)]);
        assert!(f.has_dots());
        assert_eq!(f.position(Symbol(11)), Some(2));
        assert_eq!(f.position(Symbol(99)), None);

        let g = Formals::new(vec![Symbol(10)]);
        assert!(!g.has_dots());
        assert!(!g.has_defaults());
    }

    #[test]
    fn test_module_functions() {
        let mut module = BcModule::new("m");
        let id = module.add_function(BcFunction { name: "f".into(), ..Default::default() });
        assert_eq!(id, FunId(0));
        assert_eq!(module.function(id).name, "f");
        let r = CodeRef { fun: id, which: WhichCode::Body };
        assert_eq!(module.code(r).size(), 0);
    }

    #[test]
    fn test_meta_json_roundtrip() {
        let meta = ModuleMeta { name: "m".into(), source_file: Some("m.tn".into()) };
        let json = meta.to_json();
        assert!(json.contains("\"m.tn\""));
        let back = ModuleMeta::from_json(&json).unwrap();
        assert_eq!(back.name, meta.name);
        assert_eq!(back.source_file, meta.source_file);
        assert!(ModuleMeta::from_json("not json").is_none());
    }
}
