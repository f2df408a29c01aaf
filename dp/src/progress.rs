//! Task progress reporting
//!
//! Trackers are scoped to one `(resource, events prefix)` pair and are
//! strictly best-effort: a broken tracker must never fail the task, so
//! the runner logs tracker errors and moves on.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use docstore::{DocumentStore, Patch};
use eyre::Result;

use crate::domain::ResourceKind;

#[async_trait]
pub trait ProgressTracker: Send + Sync {
    async fn start(&self, kind: ResourceKind, id: &str, prefix: &str) -> Result<()>;
    async fn end(&self, kind: ResourceKind, id: &str, prefix: &str, failed: bool) -> Result<()>;
}

/// No-op tracker for tests and the isolated child process
pub struct NoopProgress;

#[async_trait]
impl ProgressTracker for NoopProgress {
    async fn start(&self, _kind: ResourceKind, _id: &str, _prefix: &str) -> Result<()> {
        Ok(())
    }

    async fn end(&self, _kind: ResourceKind, _id: &str, _prefix: &str, _failed: bool) -> Result<()> {
        Ok(())
    }
}

/// Tracker persisting a `taskProgress` sub-document on the resource
///
/// API consumers poll this field to render progress to users.
pub struct StoreProgress {
    store: Arc<dyn DocumentStore>,
}

impl StoreProgress {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProgressTracker for StoreProgress {
    async fn start(&self, kind: ResourceKind, id: &str, prefix: &str) -> Result<()> {
        let patch = Patch::new()
            .set("taskProgress.task", prefix)
            .set("taskProgress.startedAt", Utc::now().to_rfc3339())
            .unset("taskProgress.endedAt")
            .unset("taskProgress.error");
        self.store.patch(kind.collection(), id, patch).await?;
        Ok(())
    }

    async fn end(&self, kind: ResourceKind, id: &str, prefix: &str, failed: bool) -> Result<()> {
        let mut patch = Patch::new()
            .set("taskProgress.task", prefix)
            .set("taskProgress.endedAt", Utc::now().to_rfc3339());
        if failed {
            patch = patch.set("taskProgress.error", true);
        }
        self.store.patch(kind.collection(), id, patch).await?;
        Ok(())
    }
}
