//! Pipeline stage tasks
//!
//! Each task processes one resource while the worker holds its lock and
//! returns a patch for the store. Tasks never write the store directly:
//! the runner applies the patch, scoping it under `draft.` when the
//! resource is draft-scoped.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docstore::Patch;
use thiserror::Error;

use crate::domain::Resource;

/// Identifier of a pipeline task
///
/// Serialized names are camelCase, matching journal event data and the
/// `exec-task` CLI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    Initializer,
    FileDownloader,
    FileStorer,
    FileNormalizer,
    CsvAnalyzer,
    GeojsonAnalyzer,
    FileValidator,
    Extender,
    Indexer,
    Finalizer,
    DatasetPublisher,
    TtlManager,
    RestExporterCsv,
    ReadApiKeyRenewer,
    ApplicationPublisher,
    CatalogHarvester,
}

impl TaskId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::FileDownloader => "fileDownloader",
            Self::FileStorer => "fileStorer",
            Self::FileNormalizer => "fileNormalizer",
            Self::CsvAnalyzer => "csvAnalyzer",
            Self::GeojsonAnalyzer => "geojsonAnalyzer",
            Self::FileValidator => "fileValidator",
            Self::Extender => "extender",
            Self::Indexer => "indexer",
            Self::Finalizer => "finalizer",
            Self::DatasetPublisher => "datasetPublisher",
            Self::TtlManager => "ttlManager",
            Self::RestExporterCsv => "restExporterCsv",
            Self::ReadApiKeyRenewer => "readApiKeyRenewer",
            Self::ApplicationPublisher => "applicationPublisher",
            Self::CatalogHarvester => "catalogHarvester",
        }
    }

    /// Journal event prefix, for tasks that journal their activity
    ///
    /// `None` means the task runs silently (background maintenance).
    pub fn events_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Initializer => Some("initialize"),
            Self::FileDownloader => Some("download"),
            Self::FileStorer => Some("store"),
            Self::FileNormalizer => Some("normalize"),
            Self::CsvAnalyzer | Self::GeojsonAnalyzer => Some("analyze"),
            Self::FileValidator => Some("validate"),
            Self::Extender => Some("extend"),
            Self::Indexer => Some("index"),
            Self::Finalizer => Some("finalize"),
            Self::DatasetPublisher
            | Self::ApplicationPublisher
            | Self::CatalogHarvester
            | Self::TtlManager
            | Self::RestExporterCsv
            | Self::ReadApiKeyRenewer => None,
        }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializer" => Ok(Self::Initializer),
            "fileDownloader" => Ok(Self::FileDownloader),
            "fileStorer" => Ok(Self::FileStorer),
            "fileNormalizer" => Ok(Self::FileNormalizer),
            "csvAnalyzer" => Ok(Self::CsvAnalyzer),
            "geojsonAnalyzer" => Ok(Self::GeojsonAnalyzer),
            "fileValidator" => Ok(Self::FileValidator),
            "extender" => Ok(Self::Extender),
            "indexer" => Ok(Self::Indexer),
            "finalizer" => Ok(Self::Finalizer),
            "datasetPublisher" => Ok(Self::DatasetPublisher),
            "ttlManager" => Ok(Self::TtlManager),
            "restExporterCsv" => Ok(Self::RestExporterCsv),
            "readApiKeyRenewer" => Ok(Self::ReadApiKeyRenewer),
            "applicationPublisher" => Ok(Self::ApplicationPublisher),
            "catalogHarvester" => Ok(Self::CatalogHarvester),
            _ => Err(format!("Unknown task: {s}")),
        }
    }
}

/// Failure of a task run
///
/// The variant decides retry policy: input errors are the resource's
/// fault and never retried, transient errors get one automatic retry.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error(transparent)]
    Transient(#[from] eyre::Report),
}

impl TaskError {
    pub fn is_input(&self) -> bool {
        matches!(self, TaskError::Input(_))
    }
}

/// One pipeline stage
#[async_trait]
pub trait Task: Send + Sync {
    /// Process the resource and return the patch to apply
    ///
    /// `resource` is the draft-merged view when a draft is live. The
    /// returned patch uses unscoped paths; the runner re-scopes them.
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError>;
}

/// Task lookup table, shared by the runner and the `exec-task` command
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Registry holding every built-in task
    pub fn builtin() -> Self {
        use builtin::*;

        let mut tasks: HashMap<TaskId, Arc<dyn Task>> = HashMap::new();
        tasks.insert(TaskId::Initializer, Arc::new(Initializer));
        tasks.insert(TaskId::FileDownloader, Arc::new(FileDownloader));
        tasks.insert(TaskId::FileStorer, Arc::new(FileStorer));
        tasks.insert(TaskId::FileNormalizer, Arc::new(FileNormalizer));
        tasks.insert(TaskId::CsvAnalyzer, Arc::new(CsvAnalyzer));
        tasks.insert(TaskId::GeojsonAnalyzer, Arc::new(GeojsonAnalyzer));
        tasks.insert(TaskId::FileValidator, Arc::new(FileValidator));
        tasks.insert(TaskId::Extender, Arc::new(Extender));
        tasks.insert(TaskId::Indexer, Arc::new(Indexer));
        tasks.insert(TaskId::Finalizer, Arc::new(Finalizer));
        tasks.insert(TaskId::DatasetPublisher, Arc::new(DatasetPublisher));
        tasks.insert(TaskId::TtlManager, Arc::new(TtlManager));
        tasks.insert(TaskId::RestExporterCsv, Arc::new(RestExporterCsv));
        tasks.insert(TaskId::ReadApiKeyRenewer, Arc::new(ReadApiKeyRenewer));
        tasks.insert(TaskId::ApplicationPublisher, Arc::new(ApplicationPublisher));
        tasks.insert(TaskId::CatalogHarvester, Arc::new(CatalogHarvester));
        Self { tasks }
    }

    /// Empty registry, for tests that register their own tasks
    pub fn empty() -> Self {
        Self { tasks: HashMap::new() }
    }

    pub fn register(&mut self, id: TaskId, task: Arc<dyn Task>) {
        self.tasks.insert(id, task);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<dyn Task>> {
        self.tasks.get(&id).cloned()
    }
}
