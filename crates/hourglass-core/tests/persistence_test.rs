//! Trigger state persistence through the store facade
//!
//! Covers restarts against the SQLite backend and write retries against
//! the in-memory backend with failure injection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use hourglass_core::documents::DocumentStore;
use hourglass_core::scheduler::{
    JobAction, JobConfig, JobDetail, JobKey, Schedule, SchedulerStore, StaticJobSource,
    StoreConfig, Trigger, TriggerKey, TriggerState, TriggerStatus,
};
use hourglass_core::{MemoryDocumentStore, SqliteDocumentStore};
use tempfile::TempDir;

fn jobs() -> Vec<JobConfig> {
    let job = JobDetail::new(
        JobKey::new("billing", "invoice"),
        JobAction::Shell {
            command: "true".into(),
            cwd: None,
        },
    );
    let hourly = Trigger::new(
        TriggerKey::new("billing", "hourly"),
        job.key.clone(),
        Schedule::interval(Duration::hours(1)),
    );
    let daily = Trigger::new(
        TriggerKey::new("billing", "daily"),
        job.key.clone(),
        Schedule::cron("0 0 6 * * *").unwrap(),
    );
    vec![JobConfig::new(job, vec![hourly, daily])]
}

fn key(name: &str) -> TriggerKey {
    TriggerKey::new("billing", name)
}

async fn open_sqlite(path: &Path) -> Arc<SchedulerStore> {
    let documents = SqliteDocumentStore::from_path(path).await.unwrap();
    let config = StoreConfig::new("billing", "node-1").with_doc_id_prefix("hg");
    let store = SchedulerStore::builder(config)
        .documents(Arc::new(documents))
        .job_source(Arc::new(StaticJobSource::new(jobs())))
        .build()
        .unwrap();
    store.initialize().await.unwrap();
    store
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_restores_trigger_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.db");

    let first = open_sqlite(&path).await;
    assert!(first.pause_trigger(&key("daily")).await);

    let batch = first
        .acquire_next_triggers(Utc::now() + Duration::seconds(1), 10, Duration::zero())
        .await;
    assert_eq!(batch.len(), 1);
    let fired = first.triggers_fired(&[key("hourly")]).await;
    let instruction = fired[0].trigger.execution_complete_instruction();
    first
        .triggered_job_complete(&key("hourly"), &fired[0].job, instruction)
        .await;
    let next_fire = first.retrieve_trigger(&key("hourly")).await.unwrap().next_fire_time;
    assert!(first.shutdown().await);

    let second = open_sqlite(&path).await;
    assert_eq!(second.trigger_state(&key("daily")).await, TriggerStatus::Paused);
    let hourly = second.retrieve_trigger(&key("hourly")).await.unwrap();
    assert_eq!(hourly.state, TriggerState::Waiting);
    assert_eq!(hourly.times_triggered, 1);
    assert_eq!(
        hourly.next_fire_time.map(|t| t.timestamp_millis()),
        next_fire.map(|t| t.timestamp_millis())
    );
    assert_eq!(second.queued_trigger_keys().await, vec![key("hourly")]);
    second.shutdown().await;
}

#[tokio::test]
async fn test_executing_trigger_of_same_node_restarts_waiting() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.db");

    let first = open_sqlite(&path).await;
    first
        .acquire_next_triggers(Utc::now() + Duration::seconds(1), 10, Duration::zero())
        .await;
    first.triggers_fired(&[key("hourly")]).await;
    assert_eq!(
        first.retrieve_trigger(&key("hourly")).await.unwrap().state,
        TriggerState::Executing
    );
    // Crash without completing the execution
    first.shutdown().await;

    let second = open_sqlite(&path).await;
    assert!(second.pending_recovery().is_empty());
    assert_eq!(
        second.retrieve_trigger(&key("hourly")).await.unwrap().state,
        TriggerState::Waiting
    );
    second.shutdown().await;
}

#[tokio::test]
async fn test_clear_all_leaves_nothing_to_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scheduler.db");

    let first = open_sqlite(&path).await;
    first.clear_all_scheduling_data().await.unwrap();
    assert_eq!(first.trigger_count().await, 0);
    first.sync_documents().await;

    let documents = SqliteDocumentStore::from_path(&path).await.unwrap();
    assert!(documents.get("hg.billing.hourly").await.unwrap().is_none());
    assert!(documents.get("hg.billing.daily").await.unwrap().is_none());
    first.shutdown().await;
}

// ============================================================================
// Write failures
// ============================================================================

#[tokio::test]
async fn test_failed_write_is_retried_on_next_flush() {
    let documents = Arc::new(MemoryDocumentStore::new());
    let store = SchedulerStore::builder(
        StoreConfig::new("billing", "node-1").with_shutdown_timeout(StdDuration::from_secs(5)),
    )
    .documents(documents.clone())
    .job_source(Arc::new(StaticJobSource::new(jobs())))
    .build()
    .unwrap();
    store.initialize().await.unwrap();
    store.sync_documents().await;

    documents.fail_id("billing.daily").await;
    assert!(store.pause_trigger(&key("daily")).await);
    assert!(store.pause_trigger(&key("hourly")).await);
    store.sync_documents().await;
    documents.heal_id("billing.daily").await;

    let hourly = documents.get("billing.hourly").await.unwrap().unwrap();
    assert_eq!(hourly["state"], "PAUSED");
    let daily = documents.get("billing.daily").await.unwrap().unwrap();
    assert_eq!(daily["state"], "WAITING");

    store.sync_documents().await;
    let daily = documents.get("billing.daily").await.unwrap().unwrap();
    assert_eq!(daily["state"], "PAUSED");
    assert_eq!(daily["node"], "node-1");
    assert!(store.shutdown().await);
}

#[tokio::test]
async fn test_failed_bulk_keeps_every_trigger_dirty() {
    let documents = Arc::new(MemoryDocumentStore::new());
    documents.fail_bulk(true);

    let store = SchedulerStore::builder(StoreConfig::new("billing", "node-1"))
        .documents(documents.clone())
        .job_source(Arc::new(StaticJobSource::new(jobs())))
        .build()
        .unwrap();
    store.initialize().await.unwrap();
    store.sync_documents().await;
    assert!(documents.is_empty().await);
    let failed_calls = documents.bulk_calls();
    assert!(failed_calls >= 1);

    documents.fail_bulk(false);
    assert!(store.pause_trigger(&key("hourly")).await);
    store.sync_documents().await;

    assert_eq!(documents.len().await, 2);
    let hourly = documents.get("billing.hourly").await.unwrap().unwrap();
    assert_eq!(hourly["state"], "PAUSED");
    assert!(documents.bulk_calls() > failed_calls);
    store.shutdown().await;
}
