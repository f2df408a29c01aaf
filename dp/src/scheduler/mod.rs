//! Scheduler loop
//!
//! A single loop per process drives a fixed pool of task slots. Each
//! iteration reaps finished slots, then either waits for a slot (pool
//! full), dispatches one acquired resource, or idles until the poll
//! interval elapses. The idle wait is cut short when a slot frees up
//! or a hook is registered, so work arrival always beats fixed
//! polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use docstore::{DocumentStore, LockService};
use eyre::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classifier::eligibility_filter;
use crate::domain::{Resource, ResourceKind};
use crate::hooks::WaitRegistry;
use crate::metrics::TaskMetrics;
use crate::runner::TaskRunner;

/// Candidate ids drawn per acquisition attempt
const SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Lock owner label recorded with every acquired lock
    pub owner: String,
}

pub struct Scheduler {
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockService>,
    runner: Arc<TaskRunner>,
    hooks: Arc<WaitRegistry>,
    metrics: Arc<TaskMetrics>,
    config: SchedulerConfig,
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
    // true whenever run() is not holding occupied slots
    drained: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockService>,
        runner: Arc<TaskRunner>,
        hooks: Arc<WaitRegistry>,
        metrics: Arc<TaskMetrics>,
        config: SchedulerConfig,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            locks,
            runner,
            hooks,
            metrics,
            config,
            stopped,
            wake: Arc::new(Notify::new()),
            drained: watch::channel(true).0,
        }
    }

    /// Prevent new dispatch and wait until every occupied slot settles
    ///
    /// In-flight tasks are never cancelled; this returns once `run` has
    /// drained them and exited its loop.
    pub async fn stop(&self) {
        info!("Scheduler::stop: requested");
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        let mut drained = self.drained.subscribe();
        let _ = drained.wait_for(|drained| *drained).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run until `stop` is called; in-flight tasks always finish
    pub async fn run(&self) {
        info!(concurrency = self.config.concurrency, "Scheduler::run: starting");
        self.drained.send_replace(false);
        let mut slots: Vec<Option<JoinHandle<()>>> = (0..self.config.concurrency).map(|_| None).collect();

        loop {
            for slot in slots.iter_mut() {
                // a finished handle may already have been consumed by
                // the select_all below, so drop it rather than await it
                if slot.as_ref().is_some_and(|handle| handle.is_finished()) {
                    *slot = None;
                }
            }

            if self.is_stopped() {
                break;
            }

            let Some(free) = slots.iter().position(|slot| slot.is_none()) else {
                // pool full: wait for any task to settle
                let occupied: Vec<_> = slots.iter_mut().filter_map(|slot| slot.as_mut()).collect();
                let _ = futures::future::select_all(occupied).await;
                continue;
            };

            match self.acquire_any().await {
                Some((kind, resource)) => {
                    debug!(slot = free, resource = %resource.label(kind), "Scheduler::run: dispatching");
                    let runner = self.runner.clone();
                    let metrics = self.metrics.clone();
                    let wake = self.wake.clone();
                    slots[free] = Some(tokio::spawn(async move {
                        if let Err(err) = runner.run(kind, resource).await {
                            metrics.internal_error("worker-iter", &err);
                        }
                        wake.notify_waiters();
                    }));
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.wake.notified() => {}
                        _ = self.hooks.waker().notified() => {}
                    }
                }
            }
        }

        for slot in slots.into_iter().flatten() {
            let _ = slot.await;
        }
        self.drained.send_replace(true);
        info!("Scheduler::run: stopped");
    }

    /// First kind in priority order that yields a locked resource
    async fn acquire_any(&self) -> Option<(ResourceKind, Resource)> {
        for kind in ResourceKind::ALL {
            match self.acquire_next(kind).await {
                Ok(Some(resource)) => return Some((kind, resource)),
                Ok(None) => {}
                Err(err) => self.metrics.internal_error("acquire", &err),
            }
        }
        None
    }

    /// Lock one eligible resource of `kind`, if any
    ///
    /// Candidates come as a random sample so one perpetually locked or
    /// fast-failing resource cannot starve the ones behind it. After
    /// locking, the document is re-read under the same filter; losing
    /// that race releases the lock and moves on.
    async fn acquire_next(&self, kind: ResourceKind) -> Result<Option<Resource>> {
        let filter = eligibility_filter(kind, Utc::now());
        let ids = self.store.sample_ids(kind.collection(), &filter, SAMPLE_LIMIT).await?;

        for id in ids {
            let key = kind.lock_key(&id);
            if !self.locks.acquire(&key, &self.config.owner).await? {
                continue;
            }

            let reread = self.store.get_matching(kind.collection(), &id, &filter).await;
            let doc = match reread {
                Ok(doc) => doc,
                Err(err) => {
                    let _ = self.locks.release(&key).await;
                    return Err(err.into());
                }
            };
            match doc {
                Some(doc) => match serde_json::from_value::<Resource>(doc) {
                    Ok(resource) => return Ok(Some(resource)),
                    Err(err) => {
                        warn!(key, error = %err, "Scheduler::acquire_next: invalid document, skipping");
                        self.locks.release(&key).await?;
                    }
                },
                None => {
                    // raced with another writer; no longer eligible
                    debug!(key, "Scheduler::acquire_next: lost re-read race");
                    self.locks.release(&key).await?;
                }
            }
        }
        Ok(None)
    }
}
