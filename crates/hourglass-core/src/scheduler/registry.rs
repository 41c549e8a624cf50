//! Registry of running scheduler stores
//!
//! Code that has to address a running store by (node, scheduler) receives a
//! registry handle explicitly. Entries are weak; a dropped store disappears
//! on the next lookup.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::store::SchedulerStore;

type RegistryKey = (String, String);

/// Running stores keyed by node id and scheduler name
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<RegistryKey, Weak<SchedulerStore>>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under its node and scheduler name
    pub fn register(&self, store: &Arc<SchedulerStore>) {
        let key = (store.node_id().to_string(), store.scheduler_name().to_string());
        debug!(node = %key.0, scheduler = %key.1, "Registering scheduler store");
        self.stores.insert(key, Arc::downgrade(store));
    }

    /// Remove a registration
    pub fn deregister(&self, node: &str, scheduler: &str) -> bool {
        self.stores
            .remove(&(node.to_string(), scheduler.to_string()))
            .is_some()
    }

    /// Look up a running store
    pub fn get(&self, node: &str, scheduler: &str) -> Option<Arc<SchedulerStore>> {
        let key = (node.to_string(), scheduler.to_string());
        let store = self.stores.get(&key).and_then(|weak| weak.upgrade());
        if store.is_none() {
            self.stores.remove_if(&key, |_, weak| weak.strong_count() == 0);
        }
        store
    }

    /// Every running store of a scheduler, across nodes
    pub fn stores_for(&self, scheduler: &str) -> Vec<Arc<SchedulerStore>> {
        self.stores.retain(|_, weak| weak.strong_count() > 0);
        self.stores
            .iter()
            .filter(|entry| entry.key().1 == scheduler)
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Node ids with at least one running store
    pub fn nodes(&self) -> BTreeSet<String> {
        self.stores
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().0.clone())
            .collect()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
