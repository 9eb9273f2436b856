//! Global environment: a stack of name scopes.
//!
//! The base scope holds script globals and registered natives. `scope` and
//! `select` push a scope holding exported locals or an arm binding.

use crate::values::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Env {
    scopes: Vec<HashMap<String, Value>>,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the innermost scope. The base scope is never removed.
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Define in the innermost scope.
    pub fn define(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /// Overwrite the innermost existing binding. Returns `false` if `name`
    /// is not bound anywhere.
    pub fn assign(&mut self, name: &str, value: Value) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = value;
                return true;
            }
        }
        false
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.scopes.iter().flat_map(|s| s.values())
    }

    /// Flattened deep copy for a spawned VM: inner bindings shadow outer
    /// ones and no `Ref` cell is shared with the source.
    pub fn snapshot(&self) -> Env {
        self.snapshot_with(Value::deep_clone)
    }

    /// Flattened copy with every value passed through `copy`.
    pub fn snapshot_with(&self, mut copy: impl FnMut(&Value) -> Value) -> Env {
        let mut flat = HashMap::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                flat.insert(k.clone(), copy(v));
            }
        }
        Env { scopes: vec![flat] }
    }
}
