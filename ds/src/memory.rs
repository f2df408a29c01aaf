//! In-memory backend, used by tests and the `memory` storage config

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::debug;

use crate::{DocumentStore, Filter, LockService, Patch, StoreError};

/// Process-local document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collections<T>(&self, f: impl FnOnce(&mut HashMap<String, BTreeMap<String, Value>>) -> T) -> T {
        let mut guard = self.collections.lock().expect("memory store poisoned");
        f(&mut guard)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        self.with_collections(|collections| {
            collections.entry(collection.to_string()).or_default().insert(id.to_string(), doc);
        });
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.with_collections(|collections| {
            collections.get(collection).and_then(|docs| docs.get(id)).cloned()
        }))
    }

    async fn get_matching(&self, collection: &str, id: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        Ok(self.with_collections(|collections| {
            collections
                .get(collection)
                .and_then(|docs| docs.get(id))
                .filter(|doc| filter.matches(doc))
                .cloned()
        }))
    }

    async fn sample_ids(&self, collection: &str, filter: &Filter, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut ids = self.with_collections(|collections| {
            collections
                .get(collection)
                .map(|docs| {
                    docs.iter()
                        .filter(|(_, doc)| filter.matches(doc))
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        ids.shuffle(&mut rand::rng());
        ids.truncate(limit);
        debug!(collection, sampled = ids.len(), "MemoryStore::sample_ids");
        Ok(ids)
    }

    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> Result<bool, StoreError> {
        Ok(self.with_collections(|collections| {
            match collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
                Some(doc) => {
                    patch.apply(doc);
                    true
                }
                None => false,
            }
        }))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self.with_collections(|collections| {
            collections.get_mut(collection).is_some_and(|docs| docs.remove(id).is_some())
        }))
    }
}

/// Process-local lock table
#[derive(Debug, Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of a key, if locked (test helper)
    pub fn owner(&self, key: &str) -> Option<String> {
        self.held.lock().expect("lock table poisoned").get(key).cloned()
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn acquire(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        let mut held = self.held.lock().expect("lock table poisoned");
        if held.contains_key(key) {
            debug!(key, "MemoryLocks::acquire: already held");
            return Ok(false);
        }
        held.insert(key.to_string(), owner.to_string());
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.held.lock().expect("lock table poisoned").remove(key);
        Ok(())
    }
}
