//! Per-resource event journal
//!
//! An append-only log of lifecycle events (`store-start`, `store-end`,
//! `error-retry`, ...) kept newest-first and capped per resource. The
//! runner also uses it to cap automatic retries: a pending
//! `error-retry` marker means the previous failure already got its
//! second chance, unless a stage has completed (`*-end`) since.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docstore::{DocumentStore, Patch};
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::domain::ResourceKind;

/// Cap on stored events per resource
pub const MAX_EVENTS: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub date: DateTime<Utc>,
    /// Free-form payload, e.g. an error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Event produced while processing a draft revision
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub draft: bool,
}

impl JournalEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            date: Utc::now(),
            data: None,
            draft: false,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn draft_scoped(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn log(&self, kind: ResourceKind, id: &str, event: JournalEvent) -> Result<()>;

    /// True when the latest failure already consumed its retry
    ///
    /// Walks events newest-first: a stage completion (`*-end`) resets
    /// the marker, a pending `error-retry` raises it.
    async fn has_recent_retry(&self, kind: ResourceKind, id: &str) -> Result<bool>;
}

fn scan_recent_retry(events: &[JournalEvent]) -> bool {
    for event in events {
        if event.event_type.ends_with("-end") {
            return false;
        }
        if event.event_type == "error-retry" {
            return true;
        }
    }
    false
}

/// Process-local journal, used by tests and the memory backend
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<String, Vec<JournalEvent>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a resource's events, newest first (test helper)
    pub fn events(&self, kind: ResourceKind, id: &str) -> Vec<JournalEvent> {
        self.entries
            .lock()
            .expect("journal poisoned")
            .get(&kind.lock_key(id))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn log(&self, kind: ResourceKind, id: &str, event: JournalEvent) -> Result<()> {
        debug!(kind = %kind, id, event = %event.event_type, "Journal::log");
        let mut entries = self.entries.lock().expect("journal poisoned");
        let events = entries.entry(kind.lock_key(id)).or_default();
        events.insert(0, event);
        events.truncate(MAX_EVENTS);
        Ok(())
    }

    async fn has_recent_retry(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let entries = self.entries.lock().expect("journal poisoned");
        Ok(entries.get(&kind.lock_key(id)).is_some_and(|events| scan_recent_retry(events)))
    }
}

/// Journal persisted as one document per resource in the store
///
/// Writes happen while the runner holds the resource lock, which
/// serializes the read-modify-write.
pub struct StoreJournal {
    store: Arc<dyn DocumentStore>,
}

const COLLECTION: &str = "journals";

impl StoreJournal {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    async fn read_events(&self, key: &str) -> Result<Vec<JournalEvent>> {
        let Some(doc) = self.store.get(COLLECTION, key).await? else {
            return Ok(Vec::new());
        };
        let events = doc.get("events").cloned().unwrap_or_default();
        Ok(serde_json::from_value(events).unwrap_or_default())
    }
}

#[async_trait]
impl Journal for StoreJournal {
    async fn log(&self, kind: ResourceKind, id: &str, event: JournalEvent) -> Result<()> {
        debug!(kind = %kind, id, event = %event.event_type, "Journal::log");
        let key = kind.lock_key(id);
        let mut events = self.read_events(&key).await?;
        events.insert(0, event);
        events.truncate(MAX_EVENTS);

        let events = serde_json::to_value(&events)?;
        let patched = self.store.patch(COLLECTION, &key, Patch::new().set("events", events.clone())).await?;
        if !patched {
            self.store
                .insert(COLLECTION, &key, serde_json::json!({ "id": key, "events": events }))
                .await?;
        }
        Ok(())
    }

    async fn has_recent_retry(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let events = self.read_events(&kind.lock_key(id)).await?;
        Ok(scan_recent_retry(&events))
    }
}
