//! Scoped variable environment
//!
//! A stack of frames. Lookups walk from the innermost frame outwards;
//! assignments always land in the innermost frame. The root frame is never
//! popped so the environment can't be left without a scope.

use crate::ast::Expr;
use crate::value::Value;
use rustc_hash::FxHashMap;

/// What a name is bound to
#[derive(Debug, Clone, PartialEq)]
pub enum EnvEntry {
    /// An expression, typically the bound tree of an earlier parameter
    Expr(Expr),
    /// An already computed value
    Value(Value),
}

/// User-defined function, expanded at bind time
#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub struct Env {
    frames: Vec<FxHashMap<String, EnvEntry>>,
    functions: FxHashMap<String, Macro>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Self {
            frames: vec![FxHashMap::default()],
            functions: FxHashMap::default(),
        }
    }

    pub fn push(&mut self) {
        self.frames.push(FxHashMap::default());
    }

    /// Drop the innermost frame, returning its bindings
    pub fn pop(&mut self) -> FxHashMap<String, EnvEntry> {
        if self.frames.len() > 1 {
            self.frames.pop().unwrap_or_default()
        } else {
            FxHashMap::default()
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn assign(&mut self, name: impl Into<String>, entry: EnvEntry) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), entry);
        }
    }

    pub fn assign_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.assign(name, EnvEntry::Value(value.into()));
    }

    pub fn assign_expr(&mut self, name: impl Into<String>, expr: Expr) {
        self.assign(name, EnvEntry::Expr(expr));
    }

    /// Remove a name from the innermost frame
    pub fn unassign(&mut self, name: &str) -> Option<EnvEntry> {
        self.frames.last_mut().and_then(|frame| frame.remove(name))
    }

    pub fn get(&self, name: &str) -> Option<&EnvEntry> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.get(name) {
            Some(EnvEntry::Value(value)) => Some(value),
            _ => None,
        }
    }

    pub fn expression(&self, name: &str) -> Option<&Expr> {
        match self.get(name) {
            Some(EnvEntry::Expr(expr)) => Some(expr),
            _ => None,
        }
    }

    /// Move a binding from the innermost frame into its parent
    ///
    /// Returns false when there is no such binding or no parent frame.
    pub fn promote(&mut self, name: &str) -> bool {
        let depth = self.frames.len();
        if depth < 2 {
            return false;
        }
        match self.frames[depth - 1].remove(name) {
            Some(entry) => {
                self.frames[depth - 2].insert(name.to_string(), entry);
                true
            },
            None => false,
        }
    }

    pub fn register_function(&mut self, function: Macro) {
        self.functions
            .insert(function.name.to_ascii_uppercase(), function);
    }

    pub fn function(&self, name: &str) -> Option<&Macro> {
        self.functions.get(&name.to_ascii_uppercase())
    }
}
