//! Cluster scenarios across several stores sharing one document store
//!
//! Every node is a full `SchedulerStore` wired to a shared
//! `StoreRegistry` through `LocalCluster`, so peer calls and recovery run
//! the same paths a real deployment does.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use hourglass_core::documents::DocumentStore;
use hourglass_core::scheduler::{
    JobAction, JobConfig, JobDetail, JobKey, LocalCluster, NotifySignaler, Schedule,
    SchedulerStore, StaticJobSource, StoreConfig, StoreRegistry, Trigger, TriggerKey,
    TriggerState,
};
use hourglass_core::MemoryDocumentStore;
use serde_json::Value;

const SCHEDULER: &str = "cluster-test";

struct Cluster {
    documents: Arc<MemoryDocumentStore>,
    registry: Arc<StoreRegistry>,
    oracle: Arc<LocalCluster>,
}

impl Cluster {
    fn new() -> Self {
        let registry = Arc::new(StoreRegistry::new());
        Self {
            documents: Arc::new(MemoryDocumentStore::new()),
            oracle: Arc::new(LocalCluster::new(registry.clone())),
            registry,
        }
    }

    async fn start_node(&self, node: &str, jobs: Vec<JobConfig>) -> Arc<SchedulerStore> {
        let config = StoreConfig::new(SCHEDULER, node)
            .with_recovery_interval(StdDuration::from_secs(3600))
            .with_shutdown_timeout(StdDuration::from_secs(5));
        let store = SchedulerStore::builder(config)
            .documents(self.documents.clone())
            .cluster(self.oracle.clone())
            .registry(self.registry.clone())
            .signaler(Arc::new(NotifySignaler::new()))
            .job_source(Arc::new(StaticJobSource::new(jobs)))
            .build()
            .unwrap();
        store.initialize().await.unwrap();
        store
    }

    async fn document(&self, id: &str) -> Option<Value> {
        self.documents.get(id).await.unwrap()
    }
}

fn exclusive_jobs() -> Vec<JobConfig> {
    let job = JobDetail::new(
        JobKey::new("reports", "nightly"),
        JobAction::Log {
            message: "building report".into(),
        },
    )
    .concurrent_execution_disallowed(true);
    let trigger = |name: &str| {
        Trigger::new(
            TriggerKey::new("reports", name),
            job.key.clone(),
            Schedule::interval(Duration::minutes(30)),
        )
    };
    vec![JobConfig::new(job.clone(), vec![trigger("t1"), trigger("t2")])]
}

fn tkey(name: &str) -> TriggerKey {
    TriggerKey::new("reports", name)
}

async fn state_of(store: &SchedulerStore, name: &str) -> TriggerState {
    store.retrieve_trigger(&tkey(name)).await.unwrap().state
}

/// Acquire and fire `t1` on a node
async fn start_executing(store: &SchedulerStore) -> JobDetail {
    let batch = store
        .acquire_next_triggers(Utc::now() + Duration::seconds(1), 1, Duration::zero())
        .await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key, tkey("t1"));
    let fired = store.triggers_fired(&[tkey("t1")]).await;
    assert_eq!(fired.len(), 1);
    fired[0].job.clone()
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_survivor_takes_over_trigger_of_departed_node() {
    let cluster = Cluster::new();
    let node_a = cluster.start_node("node-a", exclusive_jobs()).await;
    start_executing(&node_a).await;
    assert_eq!(state_of(&node_a, "t2").await, TriggerState::Blocked);

    // node-a goes away mid-execution
    assert!(node_a.shutdown().await);
    let persisted = cluster.document("reports.t1").await.unwrap();
    assert_eq!(persisted["state"], "EXECUTING");
    assert_eq!(persisted["node"], "node-a");
    assert!(cluster.registry.get("node-a", SCHEDULER).is_none());

    let node_b = cluster.start_node("node-b", exclusive_jobs()).await;
    assert_eq!(node_b.pending_recovery(), [tkey("t1")].into_iter().collect());
    assert_eq!(state_of(&node_b, "t1").await, TriggerState::Executing);
    assert_eq!(state_of(&node_b, "t2").await, TriggerState::Blocked);

    // No peer confirms the execution
    assert!(!node_b.run_recovery_pass().await);
    assert_eq!(state_of(&node_b, "t1").await, TriggerState::Waiting);
    assert_eq!(state_of(&node_b, "t2").await, TriggerState::Waiting);
    assert!(node_b.pending_recovery().is_empty());

    let queued = node_b.queued_trigger_keys().await;
    assert!(queued.contains(&tkey("t1")));
    assert!(queued.contains(&tkey("t2")));

    node_b.shutdown().await;
    let persisted = cluster.document("reports.t1").await.unwrap();
    assert_eq!(persisted["state"], "WAITING");
    assert_eq!(persisted["node"], "node-b");
}

#[tokio::test]
async fn test_live_peer_keeps_trigger_until_it_completes() {
    let cluster = Cluster::new();
    let node_a = cluster.start_node("node-a", exclusive_jobs()).await;
    let job = start_executing(&node_a).await;
    node_a.sync_documents().await;

    let node_b = cluster.start_node("node-b", exclusive_jobs()).await;
    node_b.sync_documents().await;
    assert_eq!(node_b.pending_recovery().len(), 1);

    // node-a still runs the job
    assert!(node_b.run_recovery_pass().await);
    assert_eq!(state_of(&node_b, "t1").await, TriggerState::Executing);

    let instruction = node_a
        .retrieve_trigger(&tkey("t1"))
        .await
        .unwrap()
        .execution_complete_instruction();
    node_a.triggered_job_complete(&tkey("t1"), &job, instruction).await;
    node_a.sync_documents().await;
    assert_eq!(cluster.document("reports.t1").await.unwrap()["state"], "WAITING");

    // The finished state is adopted rather than overwritten
    assert!(!node_b.run_recovery_pass().await);
    let adopted = node_b.retrieve_trigger(&tkey("t1")).await.unwrap();
    assert_eq!(adopted.state, TriggerState::Waiting);
    assert_eq!(adopted.times_triggered, 1);
    assert_eq!(state_of(&node_b, "t2").await, TriggerState::Waiting);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

// ============================================================================
// Membership changes
// ============================================================================

#[tokio::test]
async fn test_membership_change_reloads_every_node() {
    let cluster = Cluster::new();
    let node_a = cluster.start_node("node-a", exclusive_jobs()).await;
    let node_b = cluster.start_node("node-b", exclusive_jobs()).await;
    node_a.sync_documents().await;
    node_b.sync_documents().await;
    assert_eq!(cluster.oracle.nodes().len(), 2);

    assert!(node_a.pause_trigger(&tkey("t2")).await);
    node_a.sync_documents().await;
    cluster.oracle.notify_changed(SCHEDULER).await;
    node_a.reload_finished().await;
    node_b.reload_finished().await;

    // node-b reads back the pause written by node-a
    assert_eq!(state_of(&node_a, "t2").await, TriggerState::Paused);
    assert_eq!(state_of(&node_b, "t2").await, TriggerState::Paused);
    assert!(!node_b.queued_trigger_keys().await.contains(&tkey("t2")));
    assert_eq!(node_b.trigger_count().await, 2);

    node_a.shutdown().await;
    node_b.shutdown().await;
    assert!(cluster.registry.is_empty());
}

#[tokio::test]
async fn test_departed_node_is_not_asked() {
    let cluster = Cluster::new();
    let node_a = cluster.start_node("node-a", exclusive_jobs()).await;
    let node_b = cluster.start_node("node-b", exclusive_jobs()).await;
    start_executing(&node_a).await;

    let keys = [tkey("t1")].into_iter().collect();
    assert_eq!(node_a.executing_trigger_keys(&keys).await, keys);
    assert!(node_b.executing_trigger_keys(&keys).await.is_empty());

    drop(node_a);
    assert_eq!(cluster.registry.stores_for(SCHEDULER).len(), 1);
    node_b.shutdown().await;
}
