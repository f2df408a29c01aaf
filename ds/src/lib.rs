//! DocStore - generic JSON document storage for the datapress daemon
//!
//! Collections of schemaless JSON documents, queryable with dotted-path
//! [`Filter`]s, patchable with dotted-path [`Patch`]es, plus a keyed
//! [`LockService`] for cross-process mutual exclusion.
//!
//! Two backends:
//!
//! - [`MemoryStore`] / [`MemoryLocks`] - process-local, for tests and
//!   development
//! - [`SqliteStore`] - durable, implements both traits over a single
//!   SQLite file

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

mod filter;
mod memory;
mod patch;
mod sqlite;

pub use filter::{Condition, Filter, FilterOp};
pub use memory::{MemoryLocks, MemoryStore};
pub use patch::Patch;
pub use sqlite::SqliteStore;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidDocument(err.to_string())
    }
}

/// A collection-oriented JSON document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or fully replace a document
    async fn insert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    /// Fetch a document by id
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Fetch a document by id only if it still matches `filter`
    ///
    /// Used for the conditional re-read after a lock acquisition: a
    /// concurrent writer may have moved the document out of the
    /// eligible state between sampling and locking.
    async fn get_matching(&self, collection: &str, id: &str, filter: &Filter) -> Result<Option<Value>, StoreError>;

    /// Random sample of up to `limit` ids of documents matching `filter`
    async fn sample_ids(&self, collection: &str, filter: &Filter, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Apply a patch to a document; returns false if the document does not exist
    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> Result<bool, StoreError>;

    /// Delete a document; returns false if it did not exist
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

/// A keyed mutex safe under concurrent callers across processes
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lock; returns false if it is already held
    async fn acquire(&self, key: &str, owner: &str) -> Result<bool, StoreError>;

    /// Release the lock unconditionally
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}
