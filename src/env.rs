//! Session environment store.
//!
//! A flat key/value store shared by all macros of a session. Values are JSON
//! so clients can set arbitrary structured configuration (active measurement
//! group, scan file, per-macro options). Macros declare required keys in
//! their definition; a missing key fails the macro before it starts running.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{MacroError, MacroResult};

/// Session-scoped environment, safe to share behind an `Arc`.
#[derive(Default)]
pub struct EnvironmentStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl EnvironmentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key, if present.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    /// Read a key, failing with `MissingEnv` when absent.
    pub fn require(&self, key: &str) -> MacroResult<serde_json::Value> {
        self.get(key)
            .ok_or_else(|| MacroError::MissingEnv(key.to_string()))
    }

    /// Set a key, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        if let Ok(mut map) = self.values.write() {
            map.insert(key.into(), value);
        }
    }

    /// Remove a key. Returns the removed value, if any.
    pub fn unset(&self, key: &str) -> Option<serde_json::Value> {
        self.values.write().ok()?.remove(key)
    }

    /// Sorted list of present keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Snapshot of the whole store.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.values.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Check that all `keys` are present, reporting the first missing one.
    pub fn check_required(&self, keys: &[String]) -> MacroResult<()> {
        for key in keys {
            self.require(key)?;
        }
        Ok(())
    }
}
