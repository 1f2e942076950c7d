//! Interned symbols.
//!
//! Symbols are per-module interned names. A handful of well-known symbols are
//! pre-seeded at fixed indices so both tiers can refer to them without a
//! table lookup.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// An interned symbol (index into the module's symbol table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub u32);

impl Symbol {
    /// The `...` symbol
    pub const DOTS: Symbol = Symbol(0);
    /// `value` (used by replacement functions)
    pub const VALUE: Symbol = Symbol(1);
    /// `srcref`
    pub const SRCREF: Symbol = Symbol(2);
    /// `c`
    pub const C: Symbol = Symbol(3);
    /// The missing-argument marker name
    pub const MISSING_ARG: Symbol = Symbol(4);

    const WELL_KNOWN: [&'static str; 5] = ["...", "value", "srcref", "c", ""];
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sym#{}", self.0)
    }
}

/// Interning table mapping names to dense `Symbol` indices.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    index: FxHashMap<String, Symbol>,
}

impl SymbolTable {
    /// Create a table with the well-known symbols pre-seeded.
    pub fn new() -> Self {
        let mut table = SymbolTable { names: Vec::new(), index: FxHashMap::default() };
        for name in Symbol::WELL_KNOWN {
            table.intern(name);
        }
        table
    }

    /// Intern a name, returning its symbol. Idempotent.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.index.get(name) {
            return sym;
        }
        let sym = Symbol(self.names.len() as u32);
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), sym);
        sym
    }

    /// Get the name of a symbol.
    pub fn name(&self, sym: Symbol) -> &str {
        &self.names[sym.0 as usize]
    }

    /// Look up an already-interned name.
    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.index.get(name).copied()
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table holds only the pre-seeded symbols.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_seeded() {
        let table = SymbolTable::new();
        assert_eq!(table.lookup("..."), Some(Symbol::DOTS));
        assert_eq!(table.lookup("c"), Some(Symbol::C));
        assert_eq!(table.name(Symbol::VALUE), "value");
    }

    #[test]
    fn test_intern_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("x");
        let b = table.intern("x");
        assert_eq!(a, b);
        assert_eq!(table.name(a), "x");

        let c = table.intern("y");
        assert_ne!(a, c);
    }
}
