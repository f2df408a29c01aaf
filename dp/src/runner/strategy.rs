//! Task execution placement
//!
//! The runner is agnostic to where a task actually runs. In-process is
//! the default; the isolated strategy shells out to `dp exec-task` so
//! a crashing or leaking task cannot take the worker down with it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use docstore::DocumentStore;
use eyre::eyre;
use tracing::debug;

use crate::domain::{Resource, ResourceKind};
use crate::tasks::{TaskError, TaskId, TaskRegistry};

/// Child exit code signaling an input error (no retry)
pub const EXIT_INPUT_ERROR: i32 = 2;

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Run the task against the (draft-merged) resource view and
    /// persist its patch
    async fn execute(&self, kind: ResourceKind, resource: &Resource, task: TaskId) -> Result<(), TaskError>;
}

pub struct InProcess {
    store: Arc<dyn DocumentStore>,
    registry: Arc<TaskRegistry>,
}

impl InProcess {
    pub fn new(store: Arc<dyn DocumentStore>, registry: Arc<TaskRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl ExecutionStrategy for InProcess {
    async fn execute(&self, kind: ResourceKind, resource: &Resource, task: TaskId) -> Result<(), TaskError> {
        let implementation = self
            .registry
            .get(task)
            .ok_or_else(|| TaskError::Transient(eyre!("task {task} is not registered")))?;

        let mut patch = implementation.process(resource).await?;
        if resource.is_draft_scoped() {
            patch = patch.scoped("draft.");
        }
        let patched = self
            .store
            .patch(kind.collection(), &resource.id, patch)
            .await
            .map_err(|err| TaskError::Transient(err.into()))?;
        if !patched {
            return Err(TaskError::Transient(eyre!("{kind} {} disappeared during {task}", resource.id)));
        }
        Ok(())
    }
}

/// Runs the task inside a `dp exec-task` child process
///
/// Exit code 0 means success, [`EXIT_INPUT_ERROR`] an input error;
/// anything else (including a crash) is treated as transient, with the
/// stderr tail as the message.
pub struct Isolated {
    config_path: Option<PathBuf>,
}

impl Isolated {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }
}

#[async_trait]
impl ExecutionStrategy for Isolated {
    async fn execute(&self, kind: ResourceKind, resource: &Resource, task: TaskId) -> Result<(), TaskError> {
        let exe = std::env::current_exe().map_err(|err| TaskError::Transient(err.into()))?;
        let mut command = tokio::process::Command::new(exe);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command.arg("exec-task").arg(kind.as_str()).arg(&resource.id).arg(task.as_str());

        debug!(kind = %kind, id = %resource.id, task = %task, "Isolated::execute: spawning");
        let output = command.output().await.map_err(|err| TaskError::Transient(err.into()))?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(EXIT_INPUT_ERROR) => Err(TaskError::Input(stderr_tail(&output.stderr))),
            code => Err(TaskError::Transient(eyre!(
                "task process exited with {:?}: {}",
                code,
                stderr_tail(&output.stderr)
            ))),
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    match text.char_indices().nth_back(1999) {
        Some((idx, _)) => text[idx..].to_string(),
        None => text.to_string(),
    }
}
