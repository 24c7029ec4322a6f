//! Symbol table built during pass 1, consulted during pass 2 resolution
//! and later by the debugger's expression evaluator.

use std::collections::HashMap;

use super::expr::ExprContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Label,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub value: i64,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
    /// Insertion order of `symbols`' keys, so iteration is deterministic
    /// regardless of hash order.
    order: Vec<String>,
    globals: Vec<String>,
    externs: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_label(&mut self, name: &str, addr: u32) -> Result<(), String> {
        self.define(name, addr as i64, SymbolKind::Label)
    }

    pub fn define_constant(&mut self, name: &str, value: i64) -> Result<(), String> {
        self.define(name, value, SymbolKind::Constant)
    }

    fn define(&mut self, name: &str, value: i64, kind: SymbolKind) -> Result<(), String> {
        let key = name.to_ascii_uppercase();
        if let Some(existing) = self.symbols.get(&key) {
            if existing.value == value && existing.kind == kind {
                return Ok(());
            }
            return Err(format!("symbol {name:?} redefined"));
        }
        self.order.push(key.clone());
        self.symbols.insert(key, Symbol { value, kind });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(&name.to_ascii_uppercase()).copied()
    }

    pub fn mark_global(&mut self, name: &str) {
        self.globals.push(name.to_string());
    }

    pub fn mark_extern(&mut self, name: &str) {
        self.externs.push(name.to_string());
    }

    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    pub fn externs(&self) -> &[String] {
        &self.externs
    }

    /// Iterates symbols in definition order (not hash order).
    pub fn iter(&self) -> impl Iterator<Item = (&str, Symbol)> {
        self.order
            .iter()
            .filter_map(|k| self.symbols.get(k).map(|s| (k.as_str(), *s)))
    }
}

/// Adapts the symbol table to the shared expression evaluator used by
/// pass-2 operand resolution. `.` resolves to `current_address`.
pub struct AssemblyExprContext<'a> {
    pub symbols: &'a SymbolTable,
    pub current_address: u32,
}

impl ExprContext for AssemblyExprContext<'_> {
    fn lookup(&self, name: &str) -> Option<i64> {
        if name == "." {
            return Some(self.current_address as i64);
        }
        self.symbols.get(name).map(|s| s.value)
    }
}
