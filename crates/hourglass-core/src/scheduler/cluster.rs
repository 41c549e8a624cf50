//! Cluster membership and peer calls
//!
//! The store consults a [`ClusterOracle`] once at startup (readiness with a
//! timeout) and during recovery (which triggers are really still executing
//! somewhere). [`SingleNode`] serves a standalone store; [`LocalCluster`]
//! answers peer calls from every store registered in a [`StoreRegistry`].

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::keys::TriggerKey;
use super::registry::StoreRegistry;
use crate::error::Result;

/// Outcome of a readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHealth {
    /// The wait ended before the cluster was ready
    pub timed_out: bool,
    /// Nodes known to be up
    pub nodes: usize,
}

/// Cluster substrate consumed by the store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterOracle: Send + Sync {
    /// Wait until the cluster is ready or `timeout` elapses
    async fn wait_for_ready(&self, timeout: Duration) -> Result<ClusterHealth>;

    /// Ask every node which of `keys` it is executing for `scheduler`
    async fn executing_triggers(
        &self,
        scheduler: &str,
        keys: &HashSet<TriggerKey>,
    ) -> Result<HashSet<TriggerKey>>;

    /// Whether other nodes may share the scheduler's triggers
    fn is_clustered(&self) -> bool;
}

/// A cluster of one
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNode;

#[async_trait]
impl ClusterOracle for SingleNode {
    async fn wait_for_ready(&self, _timeout: Duration) -> Result<ClusterHealth> {
        Ok(ClusterHealth {
            timed_out: false,
            nodes: 1,
        })
    }

    async fn executing_triggers(
        &self,
        _scheduler: &str,
        _keys: &HashSet<TriggerKey>,
    ) -> Result<HashSet<TriggerKey>> {
        Ok(HashSet::new())
    }

    fn is_clustered(&self) -> bool {
        false
    }
}

/// In-process cluster built from the stores of a registry
///
/// Each registered store is one node. Peer calls go straight to the
/// responder side of each store.
#[derive(Clone)]
pub struct LocalCluster {
    registry: Arc<StoreRegistry>,
}

impl LocalCluster {
    /// Create a cluster view over a registry
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self { registry }
    }

    /// Registry backing this cluster
    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    /// Distinct node ids currently registered
    pub fn nodes(&self) -> BTreeSet<String> {
        self.registry.nodes()
    }

    /// Tell every store of a scheduler that membership changed
    pub async fn notify_changed(&self, scheduler: &str) {
        let stores = self.registry.stores_for(scheduler);
        info!(scheduler, nodes = stores.len(), "Cluster membership changed");
        for store in stores {
            store.on_cluster_changed().await;
        }
    }
}

#[async_trait]
impl ClusterOracle for LocalCluster {
    async fn wait_for_ready(&self, _timeout: Duration) -> Result<ClusterHealth> {
        Ok(ClusterHealth {
            timed_out: false,
            nodes: self.registry.nodes().len().max(1),
        })
    }

    async fn executing_triggers(
        &self,
        scheduler: &str,
        keys: &HashSet<TriggerKey>,
    ) -> Result<HashSet<TriggerKey>> {
        let stores = self.registry.stores_for(scheduler);
        let answers = join_all(stores.iter().map(|store| async move {
            let found = store.executing_trigger_keys(keys).await;
            debug!(node = store.node_id(), count = found.len(), "Peer reported executing triggers");
            found
        }))
        .await;
        Ok(answers.into_iter().flatten().collect())
    }

    fn is_clustered(&self) -> bool {
        true
    }
}
