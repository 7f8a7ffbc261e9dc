//! Helper-variable keys
//!
//! Sub-expressions that need their own history (a temporal operator over
//! `a - b`, a TIMER accumulator) are lifted into named helper variables.
//! The name is derived from the canonical text so the same sub-expression
//! always maps to the same buffer across rebinds.

use crate::ast::Expr;
use sha2::{Digest, Sha256};

/// Prefix shared by every generated key
pub const HELPER_PREFIX: &str = "auto_";

const KEY_LENGTH: usize = 10;
const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Stable key for a sub-expression
pub fn helper_key(expr: &Expr) -> String {
    key_for_text(&expr.to_string())
}

fn key_for_text(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut key = String::with_capacity(HELPER_PREFIX.len() + KEY_LENGTH);
    key.push_str(HELPER_PREFIX);
    for byte in digest.iter().take(KEY_LENGTH) {
        key.push(ALPHABET[(*byte as usize) % ALPHABET.len()] as char);
    }
    key
}

pub fn is_helper(name: &str) -> bool {
    name.starts_with(HELPER_PREFIX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HelperVariable {
    pub key: String,
    pub expression: Expr,
}

/// Generated key to defining sub-expression, filled in during binding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HelperVariables {
    entries: Vec<HelperVariable>,
}

impl HelperVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sub-expression and return its key
    ///
    /// Registering the same expression twice returns the existing key. A
    /// different expression that hashes to a taken key gets `_2`, `_3`, ...
    pub fn register(&mut self, expression: Expr) -> String {
        let base = helper_key(&expression);
        let mut key = base.clone();
        let mut suffix = 1;
        loop {
            match self.entries.iter().find(|h| h.key == key) {
                None => break,
                Some(existing) if existing.expression == expression => return key,
                Some(_) => {
                    suffix += 1;
                    key = format!("{}_{}", base, suffix);
                },
            }
        }
        self.entries.push(HelperVariable {
            key: key.clone(),
            expression,
        });
        key
    }

    /// Record a definition under a caller-chosen key, replacing any previous one
    pub fn insert(&mut self, key: impl Into<String>, expression: Expr) {
        let key = key.into();
        match self.entries.iter_mut().find(|h| h.key == key) {
            Some(existing) => existing.expression = expression,
            None => self.entries.push(HelperVariable { key, expression }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Expr> {
        self.entries
            .iter()
            .find(|h| h.key == key)
            .map(|h| &h.expression)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HelperVariable> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything registered after the first `len` entries
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}
