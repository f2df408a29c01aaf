//! Wait/hook registry
//!
//! Synchronization points keyed by task, or by task and resource:
//! `"finalizer"` resolves on the next finalization of any resource,
//! `"finalizer/ds-1"` only for that one. The task runner is the sole
//! producer of resolutions; waiting is bounded by a caller-supplied
//! timeout. Registering a hook also wakes an idle scheduler so tests
//! and API callers do not wait out a full poll interval.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tracing::debug;

use crate::domain::Resource;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("task failed: {message}")]
    Failed { resource: Box<Resource>, message: String },
    /// The registry was cleared while waiting (process teardown)
    #[error("hook abandoned")]
    Abandoned,
}

type HookResult = Result<Box<Resource>, HookError>;

#[derive(Default)]
pub struct WaitRegistry {
    entries: Mutex<HashMap<String, oneshot::Sender<HookResult>>>,
    waker: Notify,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notified when a hook is registered or a slot frees up
    pub fn waker(&self) -> &Notify {
        &self.waker
    }

    /// Wait for the next settlement of `key`, bounded by `timeout`
    ///
    /// A second wait on the same key replaces the first, which then
    /// reports [`HookError::Abandoned`].
    pub async fn wait(&self, key: &str, timeout: Duration) -> Result<Box<Resource>, HookError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.lock().expect("wait registry poisoned");
            entries.insert(key.to_string(), tx);
        }
        debug!(key, "WaitRegistry::wait: registered");
        self.waker.notify_waiters();

        tokio::select! {
            settled = rx => settled.unwrap_or(Err(HookError::Abandoned)),
            _ = tokio::time::sleep(timeout) => {
                self.entries.lock().expect("wait registry poisoned").remove(key);
                Err(HookError::Timeout(key.to_string()))
            }
        }
    }

    /// Settle a key successfully; no-op if nobody is waiting
    pub fn resolve(&self, key: &str, resource: &Resource) {
        if let Some(tx) = self.entries.lock().expect("wait registry poisoned").remove(key) {
            debug!(key, "WaitRegistry::resolve");
            let _ = tx.send(Ok(Box::new(resource.clone())));
        }
    }

    /// Settle a key with a task failure; no-op if nobody is waiting
    pub fn reject(&self, key: &str, resource: &Resource, message: &str) {
        if let Some(tx) = self.entries.lock().expect("wait registry poisoned").remove(key) {
            debug!(key, message, "WaitRegistry::reject");
            let _ = tx.send(Err(HookError::Failed {
                resource: Box::new(resource.clone()),
                message: message.to_string(),
            }));
        }
    }

    /// Drop every pending entry; their waiters observe `Abandoned`
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("wait registry poisoned");
        let drained = entries.len();
        entries.clear();
        if drained > 0 {
            debug!(drained, "WaitRegistry::clear");
        }
    }

    pub fn pending(&self) -> usize {
        self.entries.lock().expect("wait registry poisoned").len()
    }
}
