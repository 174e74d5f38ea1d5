//! Typed per-conversation variables exposed to scripts

use std::collections::HashMap;

/// A variable value; computed variables hold a template string the
/// expression engine evaluates on read.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Int(i64),
    Str(String),
    Computed(String),
}

/// Group-scoped variable store
#[derive(Debug, Default)]
pub struct VarStore {
    vars: HashMap<String, HashMap<String, VarValue>>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, group_id: &str, key: &str, value: VarValue) {
        self.vars
            .entry(group_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, group_id: &str, key: &str) -> Option<&VarValue> {
        self.vars.get(group_id)?.get(key)
    }

    pub fn int_get(&self, group_id: &str, key: &str) -> Option<i64> {
        match self.get(group_id, key) {
            Some(VarValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn int_set(&mut self, group_id: &str, key: &str, value: i64) {
        self.set(group_id, key, VarValue::Int(value));
    }

    pub fn str_get(&self, group_id: &str, key: &str) -> Option<String> {
        match self.get(group_id, key) {
            Some(VarValue::Str(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn str_set(&mut self, group_id: &str, key: &str, value: impl Into<String>) {
        self.set(group_id, key, VarValue::Str(value.into()));
    }

    pub fn computed_get(&self, group_id: &str, key: &str) -> Option<String> {
        match self.get(group_id, key) {
            Some(VarValue::Computed(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn computed_set(&mut self, group_id: &str, key: &str, expr: impl Into<String>) {
        self.set(group_id, key, VarValue::Computed(expr.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_is_strict() {
        let mut store = VarStore::new();
        store.int_set("g1", "hp", 12);
        store.str_set("g1", "name", "Aria");

        assert_eq!(store.int_get("g1", "hp"), Some(12));
        assert_eq!(store.str_get("g1", "hp"), None);
        assert_eq!(store.str_get("g1", "name"), Some("Aria".to_string()));
        assert_eq!(store.int_get("g2", "hp"), None);
    }
}
