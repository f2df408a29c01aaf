//! SQLite backend
//!
//! One `documents` table holds every collection; documents are stored
//! as JSON text and filters are evaluated in Rust over a randomized
//! scan. A `locks` table provides the keyed mutex via conditional
//! insert, which is atomic under SQLite's single-writer model.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use crate::{DocumentStore, Filter, LockService, Patch, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    doc        TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS locks (
    key         TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
";

/// Durable document store and lock service over a single SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.as_ref().display(), "SqliteStore::open");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a transient in-memory database (tests)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("sqlite connection poisoned");
        f(&conn)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(&doc)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO documents (collection, id, doc) VALUES (?1, ?2, ?3)
                 ON CONFLICT (collection, id) DO UPDATE SET doc = excluded.doc",
                params![collection, id, text],
            )?;
            Ok(())
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let text: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT doc FROM documents WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn get_matching(&self, collection: &str, id: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        Ok(self.get(collection, id).await?.filter(|doc| filter.matches(doc)))
    }

    async fn sample_ids(&self, collection: &str, filter: &Filter, limit: usize) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, doc FROM documents WHERE collection = ?1 ORDER BY RANDOM()")?;
            let mut rows = stmt.query(params![collection])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                if ids.len() >= limit {
                    break;
                }
                let id: String = row.get(0)?;
                let text: String = row.get(1)?;
                let doc: Value = serde_json::from_str(&text)?;
                if filter.matches(&doc) {
                    ids.push(id);
                }
            }
            Ok(ids)
        })
    }

    async fn patch(&self, collection: &str, id: &str, patch: Patch) -> Result<bool, StoreError> {
        // read-modify-write; callers serialize writes per document via the lock service
        let Some(mut doc) = self.get(collection, id).await? else {
            return Ok(false);
        };
        patch.apply(&mut doc);
        self.insert(collection, id, doc).await?;
        Ok(true)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
            Ok(changed > 0)
        })
    }
}

#[async_trait]
impl LockService for SqliteStore {
    async fn acquire(&self, key: &str, owner: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO locks (key, owner, acquired_at) VALUES (?1, ?2, ?3)",
                params![key, owner, Utc::now().to_rfc3339()],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM locks WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_roundtrip_and_patch() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert("datasets", "ds-1", json!({ "id": "ds-1", "status": "created" }))
            .await
            .unwrap();

        assert!(
            store
                .patch("datasets", "ds-1", Patch::new().set("draft.status", "loaded"))
                .await
                .unwrap()
        );
        let doc = store.get("datasets", "ds-1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "created");
        assert_eq!(doc["draft"]["status"], "loaded");
    }

    #[tokio::test]
    async fn test_sample_respects_filter_and_limit() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..10 {
            let status = if i < 4 { "created" } else { "finalized" };
            store
                .insert("datasets", &format!("ds-{i}"), json!({ "id": format!("ds-{i}"), "status": status }))
                .await
                .unwrap();
        }
        let ids = store
            .sample_ids("datasets", &Filter::eq("status", "created"), 100)
            .await
            .unwrap();
        assert_eq!(ids.len(), 4);

        let ids = store
            .sample_ids("datasets", &Filter::eq("status", "created"), 2)
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_locks_are_exclusive() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.acquire("dataset:ds-1", "worker-a").await.unwrap());
        assert!(!store.acquire("dataset:ds-1", "worker-b").await.unwrap());
        store.release("dataset:ds-1").await.unwrap();
        assert!(store.acquire("dataset:ds-1", "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut attempts = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            attempts.push(tokio::spawn(async move {
                store.acquire("dataset:ds-1", &format!("worker-{i}")).await.unwrap()
            }));
        }
        let mut won = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);

        assert!(!store.acquire("dataset:ds-1", "late").await.unwrap());
        store.release("dataset:ds-1").await.unwrap();
        assert!(store.acquire("dataset:ds-1", "late").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).unwrap();
        store.insert("catalogs", "c-1", json!({ "id": "c-1" })).await.unwrap();
        assert!(store.get("catalogs", "c-1").await.unwrap().is_some());
    }
}
