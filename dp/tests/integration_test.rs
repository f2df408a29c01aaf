//! Integration tests for Datapress
//!
//! These tests drive the full stack: scheduler loop, lock acquisition,
//! classification, task execution, journaling and hooks, against both
//! the memory and sqlite backends.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use datapress::journal::StoreJournal;
use datapress::progress::StoreProgress;
use datapress::runner::{InProcess, TaskRunner};
use datapress::scheduler::{Scheduler, SchedulerConfig};
use datapress::tasks::TaskRegistry;
use datapress::{HookError, Status, TaskMetrics, WaitRegistry};
use docstore::{DocumentStore, LockService, MemoryLocks, MemoryStore, SqliteStore};
use serde_json::json;
use tempfile::TempDir;

fn csv_file() -> serde_json::Value {
    json!({ "name": "data.csv", "mimetype": "text/csv" })
}

/// Assemble a scheduler over the given backend, with retries disabled
fn build_stack(
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockService>,
) -> (Arc<Scheduler>, Arc<WaitRegistry>) {
    let hooks = Arc::new(WaitRegistry::new());
    let metrics = Arc::new(TaskMetrics::new());
    let stopped = Arc::new(AtomicBool::new(false));
    let strategy = Arc::new(InProcess::new(store.clone(), Arc::new(TaskRegistry::builtin())));
    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        locks.clone(),
        Arc::new(StoreJournal::new(store.clone())),
        Arc::new(StoreProgress::new(store.clone())),
        hooks.clone(),
        metrics.clone(),
        strategy,
        None,
        stopped.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store,
        locks,
        runner,
        hooks.clone(),
        metrics,
        SchedulerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            owner: "integration".to_string(),
        },
        stopped,
    ));
    (scheduler, hooks)
}

/// Register a finalization hook before the scheduler can race it
async fn wait_for_finalizer(
    hooks: &Arc<WaitRegistry>,
    id: &str,
) -> tokio::task::JoinHandle<Result<Box<datapress::Resource>, HookError>> {
    let key = format!("finalizer/{id}");
    let handle = {
        let hooks = hooks.clone();
        tokio::spawn(async move { hooks.wait(&key, Duration::from_secs(10)).await })
    };
    while hooks.pending() == 0 {
        tokio::task::yield_now().await;
    }
    handle
}

// =============================================================================
// End-to-end pipeline
// =============================================================================

#[tokio::test]
async fn test_csv_dataset_runs_to_finalized() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    store
        .insert(
            "datasets",
            "ds-1",
            json!({ "id": "ds-1", "status": "created", "originalFile": csv_file() }),
        )
        .await
        .unwrap();

    let (scheduler, hooks) = build_stack(store.clone(), locks.clone());
    let waiting = wait_for_finalizer(&hooks, "ds-1").await;
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let finalized = tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .expect("pipeline did not finalize")
        .unwrap()
        .unwrap();
    assert_eq!(finalized.status, Status::Finalized);

    let doc = store.get("datasets", "ds-1").await.unwrap().unwrap();
    assert_eq!(doc["status"], "finalized");
    assert!(doc["finalizedAt"].is_string());
    // the stored file mirrors the uploaded one for basic types
    assert_eq!(doc["file"]["mimetype"], "text/csv");

    // every stage left its start/end pair, newest first
    let journal = store.get("journals", "dataset:ds-1").await.unwrap().unwrap();
    let events = journal["events"].as_array().unwrap();
    assert_eq!(events[0]["type"], "finalize-end");
    assert!(events.iter().any(|e| e["type"] == "initialize-start"));
    assert!(events.iter().any(|e| e["type"] == "validate-end"));

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop())
        .await
        .expect("scheduler did not stop");
    running.await.unwrap();
    assert!(locks.owner("dataset:ds-1").is_none());
}

#[tokio::test]
async fn test_partial_rest_update_keeps_status_finalized() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    store
        .insert(
            "datasets",
            "ds-rest",
            json!({
                "id": "ds-rest",
                "status": "finalized",
                "isRest": true,
                "_partialRestStatus": "updated"
            }),
        )
        .await
        .unwrap();

    let (scheduler, hooks) = build_stack(store.clone(), locks);
    let waiting = wait_for_finalizer(&hooks, "ds-rest").await;
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .expect("partial update did not finalize")
        .unwrap()
        .unwrap();

    let doc = store.get("datasets", "ds-rest").await.unwrap().unwrap();
    assert_eq!(doc["status"], "finalized");
    assert!(doc.get("_partialRestStatus").is_none());

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_draft_pipeline_never_touches_published_version() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    store
        .insert(
            "datasets",
            "ds-draft",
            json!({
                "id": "ds-draft",
                "status": "finalized",
                "originalFile": csv_file(),
                "file": { "name": "v1.csv", "mimetype": "text/csv" },
                "draft": {
                    "status": "loaded",
                    "draftReason": "file-updated",
                    "originalFile": { "name": "v2.csv", "mimetype": "text/csv" }
                }
            }),
        )
        .await
        .unwrap();

    let (scheduler, hooks) = build_stack(store.clone(), locks);
    let waiting = wait_for_finalizer(&hooks, "ds-draft").await;
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .expect("draft pipeline did not finalize")
        .unwrap()
        .unwrap();

    let doc = store.get("datasets", "ds-draft").await.unwrap().unwrap();
    // published version untouched, all progress scoped under draft.*
    assert_eq!(doc["status"], "finalized");
    assert_eq!(doc["file"]["name"], "v1.csv");
    assert_eq!(doc["draft"]["status"], "finalized");
    assert_eq!(doc["draft"]["file"]["name"], "v2.csv");

    let journal = store.get("journals", "dataset:ds-draft").await.unwrap().unwrap();
    let events = journal["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["type"] == "store-start" && e["draft"] == true));

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_input_error_rejects_finalizer_waiter() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    // loaded without an uploaded file: the storer rejects its input
    store
        .insert("datasets", "ds-bad", json!({ "id": "ds-bad", "status": "loaded" }))
        .await
        .unwrap();

    let (scheduler, hooks) = build_stack(store.clone(), locks);
    let waiting = wait_for_finalizer(&hooks, "ds-bad").await;
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let err = tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .expect("failure did not settle the hook")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HookError::Failed { .. }));

    let doc = store.get("datasets", "ds-bad").await.unwrap().unwrap();
    assert_eq!(doc["status"], "error");
    assert_eq!(doc["errorStatus"], "loaded");
    assert!(doc.get("errorRetry").is_none());

    let journal = store.get("journals", "dataset:ds-bad").await.unwrap().unwrap();
    assert_eq!(journal["events"][0]["type"], "error");

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

// =============================================================================
// Publication and harvest kinds
// =============================================================================

#[tokio::test]
async fn test_application_publication_processed() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    store
        .insert(
            "applications",
            "app-1",
            json!({
                "id": "app-1",
                "publications": [
                    { "target": "portal", "status": "waiting" },
                    { "target": "old-portal", "status": "deleted" }
                ]
            }),
        )
        .await
        .unwrap();

    let (scheduler, _hooks) = build_stack(store.clone(), locks);
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let mut published = false;
    for _ in 0..200 {
        let doc = store.get("applications", "app-1").await.unwrap().unwrap();
        let publications = doc["publications"].as_array().unwrap();
        if publications.len() == 1 && publications[0]["status"] == "published" {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(published, "publication was not processed");

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_catalog_harvest_reschedules_itself() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    store
        .insert(
            "catalogs",
            "cat-1",
            json!({
                "id": "cat-1",
                "autoUpdate": { "active": true, "nextUpdate": "2020-01-01T00:00:00Z" }
            }),
        )
        .await
        .unwrap();

    let (scheduler, _hooks) = build_stack(store.clone(), locks);
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let mut rescheduled = false;
    for _ in 0..200 {
        let doc = store.get("catalogs", "cat-1").await.unwrap().unwrap();
        if doc["autoUpdate"]["lastUpdate"].is_string() && doc["autoUpdate"]["nextUpdate"] != "2020-01-01T00:00:00Z" {
            rescheduled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rescheduled, "harvest did not run");

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

// =============================================================================
// Sqlite backend
// =============================================================================

#[tokio::test]
async fn test_pipeline_on_sqlite_backend() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(SqliteStore::open(temp_dir.path().join("dp.db")).unwrap());
    store
        .insert(
            "datasets",
            "ds-1",
            json!({ "id": "ds-1", "status": "created", "originalFile": csv_file() }),
        )
        .await
        .unwrap();

    let (scheduler, hooks) = build_stack(store.clone(), store.clone());
    let waiting = wait_for_finalizer(&hooks, "ds-1").await;
    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let finalized = tokio::time::timeout(Duration::from_secs(10), waiting)
        .await
        .expect("pipeline did not finalize on sqlite")
        .unwrap()
        .unwrap();
    assert_eq!(finalized.status, Status::Finalized);

    let doc = store.get("datasets", "ds-1").await.unwrap().unwrap();
    assert_eq!(doc["status"], "finalized");
    // the journal survives in the same database
    let journal = store.get("journals", "dataset:ds-1").await.unwrap().unwrap();
    assert_eq!(journal["events"][0]["type"], "finalize-end");

    tokio::time::timeout(Duration::from_secs(5), scheduler.stop()).await.unwrap();
    running.await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_idle_scheduler_stops_quickly() {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(MemoryLocks::new());
    let (scheduler, _hooks) = build_stack(store, locks);

    let running = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), scheduler.stop())
        .await
        .expect("idle scheduler should stop within the poll interval");
    running.await.unwrap();
}
