//! Dotted-path patches for JSON documents
//!
//! A `Patch` is an ordered pair of `set` and `unset` operations using
//! the same dotted-path convention as [`crate::Filter`]. `set` creates
//! intermediate objects as needed; `unset` is a no-op on missing paths.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A set of field updates applied atomically to one document
#[derive(Debug, Clone, Default)]
pub struct Patch {
    set: BTreeMap<String, Value>,
    unset: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `set` operation (builder style)
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(path.into(), value.into());
        self
    }

    /// Add an `unset` operation (builder style)
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Prefix every path in the patch, e.g. with `"draft."`
    pub fn scoped(self, prefix: &str) -> Self {
        Self {
            set: self
                .set
                .into_iter()
                .map(|(path, value)| (format!("{prefix}{path}"), value))
                .collect(),
            unset: self.unset.into_iter().map(|path| format!("{prefix}{path}")).collect(),
        }
    }

    /// Apply the patch in place: all `set` operations, then all `unset`
    pub fn apply(&self, doc: &mut Value) {
        for (path, value) in &self.set {
            set_path(doc, path, value.clone());
        }
        for path in &self.unset {
            unset_path(doc, path);
        }
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if !doc.is_object() {
                *doc = Value::Object(Map::new());
            }
            let map = doc.as_object_mut().unwrap();
            let child = map.entry(head.to_string()).or_insert(Value::Object(Map::new()));
            set_path(child, rest, value);
        }
        None => {
            if !doc.is_object() {
                *doc = Value::Object(Map::new());
            }
            doc.as_object_mut().unwrap().insert(path.to_string(), value);
        }
    }
}

fn unset_path(doc: &mut Value, path: &str) {
    match path.split_once('.') {
        Some((head, rest)) => {
            if let Some(child) = doc.get_mut(head) {
                unset_path(child, rest);
            }
        }
        None => {
            if let Some(map) = doc.as_object_mut() {
                map.remove(path);
            }
        }
    }
}
