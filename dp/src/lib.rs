//! Datapress - data resource publishing pipeline
//!
//! Datapress drives datasets, applications and catalogs through a
//! processing pipeline: a single scheduler loop acquires eligible
//! resources under a distributed lock, classifies the next stage with
//! an ordered rule ladder, and runs the stage task inside a bounded
//! concurrency pool.
//!
//! # Core Concepts
//!
//! - **State-driven**: the store is the only source of truth; the
//!   classifier derives the next step from the document alone
//! - **Single writer per resource**: a keyed lock serializes all task
//!   execution for one resource, even across worker processes
//! - **Draft duality**: a draft revision carries its own status and
//!   error fields, so a failing draft never touches the published
//!   version
//! - **Bounded pool**: pool size is the only concurrency throttle
//!
//! # Modules
//!
//! - [`classifier`] - per-kind rule ladders and eligibility filters
//! - [`scheduler`] - slot pool and resource acquisition loop
//! - [`runner`] - lock-held task execution, retries, journaling
//! - [`tasks`] - task registry and built-in stage tasks
//! - [`hooks`] - keyed wait registry for tests and API callers
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod classifier;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod hooks;
pub mod journal;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod tasks;

// Re-export commonly used types
pub use classifier::{Decision, SideEffect, classify, eligibility_filter};
pub use config::{Config, StorageConfig, WorkerConfig};
pub use domain::{Resource, ResourceKind, Status};
pub use hooks::{HookError, WaitRegistry};
pub use journal::{Journal, JournalEvent, MemoryJournal, StoreJournal};
pub use metrics::{MetricsSnapshot, TaskMetrics};
pub use progress::{NoopProgress, ProgressTracker, StoreProgress};
pub use runner::{ExecutionStrategy, InProcess, Isolated, TaskRunner};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use tasks::{Task, TaskError, TaskId, TaskRegistry};
