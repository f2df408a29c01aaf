//! Worker metrics
//!
//! A small in-process histogram of task durations labeled by task and
//! terminal status, plus the internal-error counter fed by the
//! scheduler. Exposed through `snapshot()` for the status command.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::error;

use crate::tasks::TaskId;

/// Histogram bucket upper bounds, in seconds
pub const DURATION_BUCKETS: [f64; 5] = [0.1, 1.0, 10.0, 60.0, 600.0];

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_INTERRUPTED: &str = "interrupted";

/// Accumulated observations for one `(task, status)` label pair
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub count: u64,
    pub total_seconds: f64,
    /// One counter per bucket bound plus the overflow bucket
    pub buckets: [u64; DURATION_BUCKETS.len() + 1],
}

impl TaskStats {
    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.total_seconds += seconds;
        let idx = DURATION_BUCKETS.iter().position(|&bound| seconds <= bound).unwrap_or(DURATION_BUCKETS.len());
        self.buckets[idx] += 1;
    }
}

#[derive(Debug, Default)]
pub struct TaskMetrics {
    stats: RwLock<HashMap<(TaskId, &'static str), TaskStats>>,
    internal_errors: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub tasks: Vec<TaskEntry>,
    pub internal_errors: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskEntry {
    pub task: String,
    pub status: String,
    #[serde(flatten)]
    pub stats: TaskStats,
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished task run
    pub fn observe(&self, task: TaskId, status: &'static str, seconds: f64) {
        let mut stats = self.stats.write().expect("metrics poisoned");
        stats.entry((task, status)).or_default().observe(seconds);
    }

    /// Count and log an error that reached the scheduler boundary
    pub fn internal_error(&self, scope: &str, err: &eyre::Report) {
        self.internal_errors.fetch_add(1, Ordering::Relaxed);
        error!(scope, error = %err, "internal error");
    }

    pub fn internal_error_count(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let stats = self.stats.read().expect("metrics poisoned");
        let mut tasks: Vec<TaskEntry> = stats
            .iter()
            .map(|((task, status), stats)| TaskEntry {
                task: task.to_string(),
                status: status.to_string(),
                stats: stats.clone(),
            })
            .collect();
        tasks.sort_by(|a, b| (&a.task, &a.status).cmp(&(&b.task, &b.status)));
        MetricsSnapshot {
            tasks,
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_buckets_and_totals() {
        let metrics = TaskMetrics::new();
        metrics.observe(TaskId::Indexer, STATUS_OK, 0.05);
        metrics.observe(TaskId::Indexer, STATUS_OK, 5.0);
        metrics.observe(TaskId::Indexer, STATUS_ERROR, 1000.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks.len(), 2);

        let ok = snapshot.tasks.iter().find(|e| e.status == STATUS_OK).unwrap();
        assert_eq!(ok.stats.count, 2);
        assert_eq!(ok.stats.buckets[0], 1);
        assert_eq!(ok.stats.buckets[2], 1);

        let err = snapshot.tasks.iter().find(|e| e.status == STATUS_ERROR).unwrap();
        // beyond the last bound lands in the overflow bucket
        assert_eq!(err.stats.buckets[DURATION_BUCKETS.len()], 1);
    }

    #[test]
    fn test_internal_error_counter() {
        let metrics = TaskMetrics::new();
        assert_eq!(metrics.internal_error_count(), 0);
        metrics.internal_error("worker-iter", &eyre::eyre!("boom"));
        metrics.internal_error("acquire", &eyre::eyre!("boom again"));
        assert_eq!(metrics.internal_error_count(), 2);
        assert_eq!(metrics.snapshot().internal_errors, 2);
    }
}
