//! Task runner
//!
//! One invocation processes one locked resource: classify, execute the
//! chosen task (or apply the scheduled side effect), then journal,
//! track progress, record metrics and settle hooks. The lock is
//! released no matter what happened; only internal errors (store or
//! journal plumbing, not task failures) propagate to the scheduler's
//! error sink.

mod strategy;

pub use strategy::{EXIT_INPUT_ERROR, ExecutionStrategy, InProcess, Isolated};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use docstore::{DocumentStore, LockService, Patch};
use eyre::Result;
use tracing::{debug, info, warn};

use crate::classifier::{Decision, SideEffect, classify};
use crate::domain::{Resource, ResourceKind, Status};
use crate::hooks::WaitRegistry;
use crate::journal::{Journal, JournalEvent};
use crate::metrics::{STATUS_ERROR, STATUS_INTERRUPTED, STATUS_OK, TaskMetrics};
use crate::progress::ProgressTracker;
use crate::tasks::{TaskError, TaskId};

pub struct TaskRunner {
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockService>,
    journal: Arc<dyn Journal>,
    progress: Arc<dyn ProgressTracker>,
    hooks: Arc<WaitRegistry>,
    metrics: Arc<TaskMetrics>,
    strategy: Arc<dyn ExecutionStrategy>,
    error_retry_delay: Option<Duration>,
    stopped: Arc<AtomicBool>,
}

impl TaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockService>,
        journal: Arc<dyn Journal>,
        progress: Arc<dyn ProgressTracker>,
        hooks: Arc<WaitRegistry>,
        metrics: Arc<TaskMetrics>,
        strategy: Arc<dyn ExecutionStrategy>,
        error_retry_delay: Option<Duration>,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            locks,
            journal,
            progress,
            hooks,
            metrics,
            strategy,
            error_retry_delay,
            stopped,
        }
    }

    /// Process one resource; the caller must hold its lock
    pub async fn run(&self, kind: ResourceKind, resource: Resource) -> Result<()> {
        let key = kind.lock_key(&resource.id);
        let result = self.process(kind, &resource).await;
        if let Err(err) = self.locks.release(&key).await {
            warn!(key, error = %err, "TaskRunner::run: lock release failed");
        }
        result
    }

    async fn process(&self, kind: ResourceKind, resource: &Resource) -> Result<()> {
        let view = if resource.has_live_draft() { resource.merged() } else { resource.clone() };

        match classify(kind, resource, Utc::now()) {
            Decision::Nothing => {
                debug!(kind = %kind, id = %resource.id, "TaskRunner::process: nothing to do");
                Ok(())
            }
            Decision::Apply(effect) => self.apply_side_effect(kind, resource, effect).await,
            Decision::Dispatch(task) => self.dispatch(kind, resource, &view, task).await,
        }
    }

    async fn apply_side_effect(&self, kind: ResourceKind, resource: &Resource, effect: SideEffect) -> Result<()> {
        info!(kind = %kind, id = %resource.id, effect = ?effect, "TaskRunner::apply_side_effect");
        let patch = match effect {
            SideEffect::OpenDraft { reason } => Patch::new()
                .set("draft.status", Status::Imported.as_str())
                .set("draft.draftReason", reason),
            SideEffect::FlagExtensionUpdates => {
                let now = Utc::now();
                let extensions: Vec<_> = resource
                    .extensions
                    .iter()
                    .cloned()
                    .map(|mut ext| {
                        if ext.active && ext.next_update.is_some_and(|t| t <= now) {
                            ext.needs_update = true;
                            ext.next_update = None;
                        }
                        ext
                    })
                    .collect();
                Patch::new().set("extensions", serde_json::to_value(&extensions)?)
            }
            SideEffect::RestoreErrorStatus { draft } => {
                let error_status = if draft {
                    resource.draft.as_deref().and_then(|d| d.error_status)
                } else {
                    resource.error_status
                };
                let Some(error_status) = error_status else {
                    // the filter and ladder both require errorStatus; a
                    // miss here means a raced administrative write
                    return Ok(());
                };
                let patch = Patch::new()
                    .set("status", error_status.as_str())
                    .unset("errorStatus")
                    .unset("errorRetry");
                if draft { patch.scoped("draft.") } else { patch }
            }
        };
        self.store.patch(kind.collection(), &resource.id, patch).await?;
        Ok(())
    }

    async fn dispatch(&self, kind: ResourceKind, resource: &Resource, view: &Resource, task: TaskId) -> Result<()> {
        let id = resource.id.clone();
        let draft = view.is_draft_scoped();
        let prefix = task.events_prefix();
        info!(kind = %kind, id, task = %task, draft, "TaskRunner::dispatch");

        if let Some(prefix) = prefix {
            self.journal_event(kind, &id, JournalEvent::new(format!("{prefix}-start")).draft_scoped(draft)).await;
            if let Err(err) = self.progress.start(kind, &id, prefix).await {
                warn!(id, prefix, error = %err, "progress start failed");
            }
        }

        let started = Instant::now();
        let result = self.strategy.execute(kind, view, task).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.metrics.observe(task, STATUS_OK, elapsed);
                self.finish_success(kind, &id, view, task, prefix).await
            }
            Err(err) if self.stopped.load(Ordering::SeqCst) => {
                // the failure is attributable to shutdown, not the resource
                self.metrics.observe(task, STATUS_INTERRUPTED, elapsed);
                warn!(kind = %kind, id, task = %task, error = %err, "task interrupted by shutdown");
                Ok(())
            }
            Err(err) => {
                self.metrics.observe(task, STATUS_ERROR, elapsed);
                self.finish_failure(kind, &id, view, task, prefix, err).await
            }
        }
    }

    async fn finish_success(
        &self,
        kind: ResourceKind,
        id: &str,
        view: &Resource,
        task: TaskId,
        prefix: Option<&str>,
    ) -> Result<()> {
        // re-read so journal events and hooks observe the persisted state
        let fresh = match self.store.get(kind.collection(), id).await? {
            Some(doc) => match serde_json::from_value::<Resource>(doc) {
                Ok(fresh) => {
                    if fresh.has_live_draft() {
                        fresh.merged()
                    } else {
                        fresh
                    }
                }
                Err(err) => {
                    warn!(kind = %kind, id, error = %err, "re-read produced an invalid document");
                    view.clone()
                }
            },
            None => {
                debug!(kind = %kind, id, "resource deleted during task");
                view.clone()
            }
        };

        if let Some(prefix) = prefix {
            self.journal_event(kind, id, JournalEvent::new(format!("{prefix}-end")).draft_scoped(fresh.is_draft_scoped()))
                .await;
            if let Err(err) = self.progress.end(kind, id, prefix, false).await {
                warn!(id, prefix, error = %err, "progress end failed");
            }
        }

        self.hooks.resolve(task.as_str(), &fresh);
        self.hooks.resolve(&format!("{task}/{id}"), &fresh);
        Ok(())
    }

    async fn finish_failure(
        &self,
        kind: ResourceKind,
        id: &str,
        view: &Resource,
        task: TaskId,
        prefix: Option<&str>,
        err: TaskError,
    ) -> Result<()> {
        let draft = view.is_draft_scoped();
        let message = err.to_string();
        warn!(kind = %kind, id, task = %task, draft, error = %message, "task failed");

        if let Some(prefix) = prefix {
            if let Err(err) = self.progress.end(kind, id, prefix, true).await {
                warn!(id, prefix, error = %err, "progress end failed");
            }
        }

        let retry = !err.is_input() && self.error_retry_delay.is_some() && !self.recently_retried(kind, id).await;

        let mut patch = Patch::new()
            .set("status", Status::Error.as_str())
            .set("errorStatus", view.status.as_str());
        if let Some(delay) = self.error_retry_delay.filter(|_| retry) {
            let retry_at = Utc::now() + chrono::Duration::from_std(delay)?;
            self.journal_event(kind, id, JournalEvent::new("error-retry").with_data(&message).draft_scoped(draft))
                .await;
            patch = patch.set("errorRetry", retry_at.to_rfc3339());
        } else {
            self.journal_event(kind, id, JournalEvent::new("error").with_data(&message).draft_scoped(draft)).await;
            patch = patch.unset("errorRetry");
        }
        if draft {
            patch = patch.scoped("draft.");
        }
        self.store.patch(kind.collection(), id, patch).await?;

        self.hooks.reject(task.as_str(), view, &message);
        self.hooks.reject(&format!("{task}/{id}"), view, &message);
        if task != TaskId::Finalizer {
            // the pipeline will not reach finalization; fail those waiters too
            self.hooks.reject(&format!("{}/{id}", TaskId::Finalizer), view, &message);
        }
        Ok(())
    }

    /// Journal failures are logged, never surfaced to the task outcome
    async fn journal_event(&self, kind: ResourceKind, id: &str, event: JournalEvent) {
        if let Err(err) = self.journal.log(kind, id, event).await {
            warn!(kind = %kind, id, error = %err, "journal write failed");
        }
    }

    /// A journal read failure counts as already-retried, erring on the
    /// side of not looping
    async fn recently_retried(&self, kind: ResourceKind, id: &str) -> bool {
        match self.journal.has_recent_retry(kind, id).await {
            Ok(recent) => recent,
            Err(err) => {
                warn!(kind = %kind, id, error = %err, "journal retry lookup failed");
                true
            }
        }
    }
}
