//! Scheduler store facade
//!
//! [`SchedulerStore`] is the storage contract the scheduling engine talks
//! to. It composes the job and trigger repositories behind one lock, so
//! every mutation of one scheduler instance is linearized. Trigger state is
//! persisted in the background by the [`PersistenceWriter`]; triggers
//! inherited as executing on another node are reconciled by the
//! [`RecoveryCoordinator`].

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::cluster::{ClusterOracle, SingleNode};
use super::config::StoreConfig;
use super::job::{JobConfig, JobConfigListener, JobDetail, JobSource, StaticJobSource, UpdateSummary};
use super::job_repository::JobRepository;
use super::keys::{GroupMatcher, JobKey, TriggerKey};
use super::persistence::PersistenceWriter;
use super::recovery::RecoveryCoordinator;
use super::registry::StoreRegistry;
use super::signaler::{NoopSignaler, SchedulerSignaler};
use super::trigger::{CompletedExecutionInstruction, Trigger, TriggerStatus};
use super::trigger_repository::{LoadedState, TriggerFiredBundle, TriggerRepository};
use crate::documents::{DocumentStore, MemoryDocumentStore, MultiGetItem};
use crate::error::{Result, StoreError};

/// Everything guarded by the store lock
struct StoreState {
    jobs: JobRepository,
    triggers: TriggerRepository,
}

impl StoreState {
    fn disallows_concurrency(&self, job: &JobKey) -> bool {
        self.jobs
            .get(job)
            .is_some_and(|job| job.concurrent_execution_disallowed)
    }

    /// Hand dirty state to the writer and drop non-durable jobs left
    /// without triggers
    fn flush(&mut self) {
        for job in self.triggers.flush() {
            self.drop_if_orphaned(&job);
        }
    }

    fn drop_if_orphaned(&mut self, job: &JobKey) {
        if self.triggers.has_triggers(job) {
            return;
        }
        if self.jobs.get(job).is_some_and(|job| !job.durable) {
            debug!(job = %job, "Removing non-durable job without triggers");
            self.triggers.unblock_job(job);
            self.jobs.remove(job);
        }
    }

    /// Store a job; a replacement that allows concurrent runs releases
    /// any blocking left by the old definition
    fn store_job(&mut self, job: JobDetail, replace: bool) -> Result<()> {
        let key = job.key.clone();
        let concurrent = !job.concurrent_execution_disallowed;
        self.jobs.insert(job, replace)?;
        if concurrent && self.triggers.unblock_job(&key) {
            debug!(job = %key, "Job now allows concurrent runs; unblocked its triggers");
        }
        Ok(())
    }

    fn store_trigger(&mut self, trigger: Trigger, replace: bool) -> Result<()> {
        if !self.jobs.contains(&trigger.job_key) {
            return Err(StoreError::JobNotFound {
                trigger: trigger.key,
                job: trigger.job_key,
            });
        }
        self.triggers.add(trigger, replace)
    }

    fn remove_trigger(&mut self, key: &TriggerKey) -> bool {
        match self.triggers.remove(key) {
            Some(trigger) => {
                self.drop_if_orphaned(&trigger.job_key);
                true
            }
            None => false,
        }
    }

    fn remove_job(&mut self, key: &JobKey) -> bool {
        let removed = self.triggers.remove_for_job(key);
        if !removed.is_empty() {
            trace!(job = %key, triggers = removed.len(), "Removed triggers of job");
        }
        self.triggers.unblock_job(key);
        self.jobs.remove(key).is_some()
    }

    fn config_of(&self, key: &JobKey) -> Option<JobConfig> {
        let job = self.jobs.get(key)?.clone();
        let triggers = self.triggers.for_job(key).into_iter().cloned().collect();
        Some(JobConfig::new(job, triggers))
    }
}

/// Clustered in-memory job and trigger store for one scheduler instance
pub struct SchedulerStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    documents: Arc<dyn DocumentStore>,
    writer: Arc<PersistenceWriter>,
    cluster: Arc<dyn ClusterOracle>,
    signaler: Arc<dyn SchedulerSignaler>,
    job_source: Arc<dyn JobSource>,
    registry: Arc<StoreRegistry>,
    recovery: RecoveryCoordinator,
    reload: std::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    this: Weak<SchedulerStore>,
}

impl SchedulerStore {
    /// Start building a store
    pub fn builder(config: StoreConfig) -> SchedulerStoreBuilder {
        SchedulerStoreBuilder::new(config)
    }

    /// Local node id
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Scheduler instance name
    pub fn scheduler_name(&self) -> &str {
        &self.config.scheduler_name
    }

    /// Store configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Trigger state survives restarts
    pub fn supports_persistence(&self) -> bool {
        true
    }

    /// Whether other nodes share this scheduler's triggers
    pub fn is_clustered(&self) -> bool {
        self.cluster.is_clustered()
    }

    /// Whether `scheduler_started` was called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StoreError::ShuttingDown);
        }
        Ok(())
    }

    fn document_id(&self, key: &TriggerKey) -> String {
        key.document_id(self.config.doc_id_prefix.as_deref())
    }

    // ---- lifecycle ----

    /// Register with the registry and load jobs and trigger state
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_running()?;
        if let Some(this) = self.this.upgrade() {
            self.registry.register(&this);
        }
        let mut state = self.state.lock().await;
        self.load(&mut state).await;
        Ok(())
    }

    /// The engine started firing
    pub fn scheduler_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!(
            scheduler = %self.config.scheduler_name,
            node = %self.config.node_id,
            "Scheduler started"
        );
    }

    /// Stop background work, write what is left and deregister
    ///
    /// Waits at most the configured shutdown timeout for pending writes.
    /// Returns false if the writer had to be aborted.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Store shutdown already initiated");
            return true;
        }
        info!(scheduler = %self.config.scheduler_name, "Shutting down scheduler store");
        self.recovery.stop();
        if let Some(reload) = self.take_reload() {
            reload.abort();
        }
        {
            let mut state = self.state.lock().await;
            state.flush();
        }
        let drained = self.writer.shutdown(self.config.shutdown_timeout()).await;
        self.registry
            .deregister(&self.config.node_id, &self.config.scheduler_name);
        info!(drained, "Scheduler store stopped");
        drained
    }

    /// Wait until every state change made so far reached the document store
    ///
    /// Writes that fail stay dirty and are retried with the next flush.
    pub async fn sync_documents(&self) {
        {
            let mut state = self.state.lock().await;
            state.flush();
        }
        self.writer.sync().await;
    }

    async fn load(&self, state: &mut StoreState) {
        let started = Instant::now();
        self.wait_for_cluster().await;

        let configs = state.jobs.load(self.job_source.as_ref()).await;
        let mut triggers: Vec<Trigger> = Vec::new();
        for config in configs {
            for trigger in config.triggers {
                if trigger.job_key != config.job.key {
                    warn!(
                        trigger = %trigger.key,
                        job = %config.job.key,
                        "Skipping trigger defined under another job"
                    );
                    continue;
                }
                if let Err(e) = trigger.validate() {
                    error!(trigger = %trigger.key, "Skipping invalid trigger: {}", e);
                    continue;
                }
                triggers.push(trigger);
            }
        }

        let ids: Vec<String> = triggers.iter().map(|t| self.document_id(&t.key)).collect();
        let loaded = match self.documents.multi_get(&ids).await {
            Ok(items) => {
                let mut by_id: HashMap<String, LoadedState> = items
                    .into_iter()
                    .map(|item| match item {
                        MultiGetItem::Found { id, source } => (id, LoadedState::Found(source)),
                        MultiGetItem::Missing { id } => (id, LoadedState::Missing),
                        MultiGetItem::Failed { id, reason } => (id, LoadedState::Failed(reason)),
                    })
                    .collect();
                triggers
                    .into_iter()
                    .zip(ids)
                    .map(|(trigger, id)| {
                        let state = by_id.remove(&id).unwrap_or(LoadedState::Missing);
                        (trigger, state)
                    })
                    .collect()
            }
            Err(e) => {
                error!(
                    "Loading trigger state failed after {}ms: {}",
                    started.elapsed().as_millis(),
                    e
                );
                Vec::new()
            }
        };

        let disallowed: HashSet<JobKey> = state
            .jobs
            .keys(&GroupMatcher::Anything)
            .into_iter()
            .filter(|key| state.disallows_concurrency(key))
            .collect();
        let pending = state
            .triggers
            .load(loaded, |job| disallowed.contains(job));
        state.flush();

        info!(
            jobs = state.jobs.len(),
            triggers = state.triggers.len(),
            pending_recovery = pending.len(),
            "Loaded scheduling data in {}ms",
            started.elapsed().as_millis()
        );
        if !pending.is_empty() {
            self.recovery.track(pending);
            self.schedule_recovery();
        }
        self.signaler.signal_scheduling_change(None);
    }

    async fn wait_for_cluster(&self) {
        let timeout = self.config.health_timeout();
        match tokio::time::timeout(timeout, self.cluster.wait_for_ready(timeout)).await {
            Ok(Ok(health)) if !health.timed_out => {
                debug!(nodes = health.nodes, "Cluster is ready");
            }
            Ok(Ok(health)) => {
                warn!(nodes = health.nodes, "Cluster not ready after {:?}; loading anyway", timeout);
            }
            Ok(Err(e)) => warn!("Cluster health check failed: {}; loading anyway", e),
            Err(_) => warn!("Cluster health check timed out after {:?}; loading anyway", timeout),
        }
    }

    fn schedule_recovery(&self) {
        let this = self.this.clone();
        self.recovery.start(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(store) => store.run_recovery_pass().await,
                    None => false,
                }
            }
        });
    }

    /// Run one recovery pass now
    ///
    /// Asks the cluster which pending triggers are still executing, re-reads
    /// the rest and takes them over. Returns whether triggers remain pending.
    pub async fn run_recovery_pass(&self) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let pending = self.recovery.pending();
        if pending.is_empty() {
            return false;
        }

        let still = {
            let state = self.state.lock().await;
            state.triggers.still_executing(&pending)
        };
        let settled: Vec<TriggerKey> = pending.difference(&still).cloned().collect();
        self.recovery.resolve(&settled);
        if still.is_empty() {
            return false;
        }

        let confirmed = match self
            .cluster
            .executing_triggers(&self.config.scheduler_name, &still)
            .await
        {
            Ok(confirmed) => confirmed,
            Err(e) => {
                warn!("Executing-trigger check failed: {}; retrying later", e);
                return true;
            }
        };
        let unconfirmed: Vec<TriggerKey> = still.difference(&confirmed).cloned().collect();
        if unconfirmed.is_empty() {
            debug!(count = confirmed.len(), "Triggers confirmed as still executing");
            return true;
        }

        let ids: Vec<String> = unconfirmed.iter().map(|key| self.document_id(key)).collect();
        let items = match self.documents.multi_get(&ids).await {
            Ok(items) => items,
            Err(e) => {
                warn!("Re-reading unconfirmed triggers failed: {}; retrying later", e);
                return true;
            }
        };
        let keys_by_id: HashMap<String, TriggerKey> = ids.into_iter().zip(unconfirmed).collect();

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut recovered = Vec::new();
        let mut queued = false;
        for item in &items {
            let Some(key) = keys_by_id.get(item.id()) else {
                continue;
            };
            let persisted = match item {
                MultiGetItem::Found { source, .. } => Some(source),
                MultiGetItem::Missing { .. } => None,
                MultiGetItem::Failed { reason, .. } => {
                    warn!(trigger = %key, "Could not re-read trigger: {}", reason);
                    continue;
                }
            };
            let disallows = state
                .triggers
                .get(key)
                .is_some_and(|t| state.disallows_concurrency(&t.job_key));
            queued |= state.triggers.recover(key, persisted, disallows);
            info!(trigger = %key, "Recovered trigger not executing on any node");
            recovered.push(key.clone());
        }
        state.flush();
        drop(guard);

        self.recovery.resolve(&recovered);
        if queued {
            self.signaler.signal_scheduling_change(None);
        }
        self.recovery.pending_count() > 0
    }

    /// Triggers still awaiting recovery
    pub fn pending_recovery(&self) -> HashSet<TriggerKey> {
        self.recovery.pending()
    }

    /// Responder side of the peer call: which of `keys` execute here
    pub async fn executing_trigger_keys(&self, keys: &HashSet<TriggerKey>) -> HashSet<TriggerKey> {
        let state = self.state.lock().await;
        state.triggers.executing_here(keys)
    }

    /// Drop in-memory data and reload it in the background
    ///
    /// Dirty state is written, and the writes awaited, before the reload
    /// reads it back. A reload still running from an earlier change is
    /// replaced.
    pub async fn on_cluster_changed(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        info!(scheduler = %self.config.scheduler_name, "Cluster changed; reloading scheduling data");
        self.recovery.stop();
        {
            let mut state = self.state.lock().await;
            state.flush();
        }

        let this = self.this.clone();
        let handle = tokio::spawn(async move {
            let Some(store) = this.upgrade() else {
                return;
            };
            store.writer.sync().await;
            let mut state = store.state.lock().await;
            state.triggers.clear();
            state.jobs.clear();
            store.load(&mut state).await;
        });
        let previous = match self.reload.lock() {
            Ok(mut reload) => reload.replace(handle),
            Err(e) => {
                warn!("Reload handle lock poisoned: {}", e);
                None
            }
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn take_reload(&self) -> Option<JoinHandle<()>> {
        self.reload.lock().ok().and_then(|mut reload| reload.take())
    }

    /// Wait for a background reload to finish
    pub async fn reload_finished(&self) {
        if let Some(reload) = self.take_reload() {
            if let Err(e) = reload.await {
                if !e.is_cancelled() {
                    error!("Reload task failed: {}", e);
                }
            }
        }
    }

    /// Remove every job and trigger, including persisted trigger state
    pub async fn clear_all_scheduling_data(&self) -> Result<()> {
        self.ensure_running()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        for key in state.triggers.keys(&GroupMatcher::Anything) {
            state.triggers.remove(&key);
        }
        state.flush();
        state.triggers.clear();
        state.jobs.clear();
        info!("Cleared all scheduling data");
        Ok(())
    }

    // ---- jobs ----

    /// Store a job
    pub async fn store_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        state.store_job(job, replace)
    }

    /// Store a job and one trigger for it
    pub async fn store_job_and_trigger(&self, job: JobDetail, trigger: Trigger) -> Result<()> {
        self.store_jobs_and_triggers(vec![JobConfig::new(job, vec![trigger])], false)
            .await
    }

    /// Store several jobs with their triggers
    ///
    /// Without `replace`, nothing is stored if any key already exists.
    pub async fn store_jobs_and_triggers(&self, configs: Vec<JobConfig>, replace: bool) -> Result<()> {
        self.ensure_running()?;
        let mut job_keys = HashSet::new();
        let mut trigger_keys = HashSet::new();
        for config in &configs {
            if !job_keys.insert(&config.job.key) {
                return Err(StoreError::JobAlreadyExists(config.job.key.clone()));
            }
            for trigger in &config.triggers {
                if !trigger_keys.insert(&trigger.key) {
                    return Err(StoreError::TriggerAlreadyExists(trigger.key.clone()));
                }
                if trigger.job_key != config.job.key {
                    return Err(StoreError::JobNotFound {
                        trigger: trigger.key.clone(),
                        job: trigger.job_key.clone(),
                    });
                }
                trigger.validate()?;
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !replace {
            for config in &configs {
                if state.jobs.contains(&config.job.key) {
                    return Err(StoreError::JobAlreadyExists(config.job.key.clone()));
                }
                if let Some(trigger) = config.triggers.iter().find(|t| state.triggers.contains(&t.key)) {
                    return Err(StoreError::TriggerAlreadyExists(trigger.key.clone()));
                }
            }
        }

        let mut earliest: Option<DateTime<Utc>> = None;
        for config in configs {
            state.store_job(config.job, replace)?;
            for trigger in config.triggers {
                let key = trigger.key.clone();
                state.store_trigger(trigger, replace)?;
                let next = state.triggers.get(&key).and_then(|t| t.next_fire_time);
                earliest = match (earliest, next) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        state.flush();
        drop(guard);
        self.signaler.signal_scheduling_change(earliest);
        Ok(())
    }

    /// Remove a job and its triggers
    pub async fn remove_job(&self, key: &JobKey) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.remove_job(key);
        state.flush();
        removed
    }

    /// Remove several jobs; true only if all existed
    pub async fn remove_jobs(&self, keys: &[JobKey]) -> bool {
        let mut state = self.state.lock().await;
        let mut all = true;
        for key in keys {
            all &= state.remove_job(key);
        }
        state.flush();
        all
    }

    /// Look up a job
    pub async fn retrieve_job(&self, key: &JobKey) -> Option<JobDetail> {
        self.state.lock().await.jobs.get(key).cloned()
    }

    /// Whether a job is stored
    pub async fn check_job_exists(&self, key: &JobKey) -> bool {
        self.state.lock().await.jobs.contains(key)
    }

    /// Number of jobs
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    /// Job keys in matching groups
    pub async fn job_keys(&self, matcher: &GroupMatcher) -> BTreeSet<JobKey> {
        self.state.lock().await.jobs.keys(matcher)
    }

    /// Job group names
    pub async fn job_group_names(&self) -> BTreeSet<String> {
        self.state.lock().await.jobs.group_names()
    }

    /// Triggers of a job
    pub async fn triggers_for_job(&self, key: &JobKey) -> Vec<Trigger> {
        let state = self.state.lock().await;
        state.triggers.for_job(key).into_iter().cloned().collect()
    }

    /// Pause every trigger of a job
    pub async fn pause_job(&self, key: &JobKey) -> usize {
        let mut state = self.state.lock().await;
        let paused = state.triggers.pause_job(key);
        state.flush();
        paused
    }

    /// Pause jobs in matching groups; returns the job groups touched
    pub async fn pause_jobs(&self, matcher: &GroupMatcher) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        let keys = state.jobs.keys(matcher);
        for key in &keys {
            state.triggers.pause_job(key);
        }
        state.flush();
        keys.iter().map(|key| key.group().to_string()).collect()
    }

    /// Resume every trigger of a job
    pub async fn resume_job(&self, key: &JobKey) -> usize {
        let mut state = self.state.lock().await;
        let resumed = state.triggers.resume_job(key);
        state.flush();
        drop(state);
        if resumed > 0 {
            self.signaler.signal_scheduling_change(None);
        }
        resumed
    }

    /// Resume jobs in matching groups; returns the job groups touched
    pub async fn resume_jobs(&self, matcher: &GroupMatcher) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        let keys = state.jobs.keys(matcher);
        for key in &keys {
            state.triggers.resume_job(key);
        }
        state.flush();
        drop(state);
        self.signaler.signal_scheduling_change(None);
        keys.iter().map(|key| key.group().to_string()).collect()
    }

    /// Replace the stored job set with a new one
    ///
    /// Jobs are matched by key and compared by version when both sides are
    /// versioned, by full definition otherwise. Listeners hear about the
    /// change before and after it is applied.
    pub async fn update_jobs(&self, configs: Vec<JobConfig>) -> Result<UpdateSummary> {
        self.ensure_running()?;
        for config in &configs {
            for trigger in &config.triggers {
                if trigger.job_key != config.job.key {
                    return Err(StoreError::JobNotFound {
                        trigger: trigger.key.clone(),
                        job: trigger.job_key.clone(),
                    });
                }
                trigger.validate()?;
            }
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut incoming: BTreeMap<JobKey, JobConfig> = configs
            .into_iter()
            .map(|config| (config.job.key.clone(), config))
            .collect();
        let current = state.jobs.keys(&GroupMatcher::Anything);

        let mut summary = UpdateSummary::default();
        for key in &current {
            match incoming.get(key) {
                None => summary.deleted.push(key.clone()),
                Some(next) => {
                    if state.config_of(key).is_some_and(|existing| existing.differs_from(next)) {
                        summary.updated.push(key.clone());
                    }
                }
            }
        }
        summary.added = incoming
            .keys()
            .filter(|key| !current.contains(*key))
            .cloned()
            .collect();
        if summary.is_empty() {
            debug!("Job definitions unchanged");
            return Ok(summary);
        }

        let listeners: Vec<Arc<dyn JobConfigListener>> = state.jobs.listeners().to_vec();
        for listener in &listeners {
            listener.before_change(&summary);
        }

        for key in &summary.deleted {
            state.remove_job(key);
        }
        for key in summary.updated.iter().chain(summary.added.iter()) {
            let Some(config) = incoming.remove(key) else {
                continue;
            };
            state.triggers.remove_for_job(key);
            state.store_job(config.job, true)?;
            for trigger in config.triggers {
                state.store_trigger(trigger, true)?;
            }
        }
        state.flush();
        drop(guard);

        for listener in &listeners {
            listener.after_change(&summary);
        }
        info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            "Applied job update"
        );
        self.signaler.signal_scheduling_change(None);
        Ok(summary)
    }

    // ---- triggers ----

    /// Store a trigger for an existing job
    pub async fn store_trigger(&self, trigger: Trigger, replace: bool) -> Result<()> {
        self.ensure_running()?;
        trigger.validate()?;
        let key = trigger.key.clone();
        let mut state = self.state.lock().await;
        state.store_trigger(trigger, replace)?;
        let next = state.triggers.get(&key).and_then(|t| t.next_fire_time);
        state.flush();
        drop(state);
        self.signaler.signal_scheduling_change(next);
        Ok(())
    }

    /// Remove a trigger; a non-durable job losing its last trigger goes too
    pub async fn remove_trigger(&self, key: &TriggerKey) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.remove_trigger(key);
        state.flush();
        removed
    }

    /// Remove several triggers; true only if all existed
    pub async fn remove_triggers(&self, keys: &[TriggerKey]) -> bool {
        let mut state = self.state.lock().await;
        let mut all = true;
        for key in keys {
            all &= state.remove_trigger(key);
        }
        state.flush();
        all
    }

    /// Swap a trigger for a new one; false if `key` is not stored
    ///
    /// The old trigger's job is kept, even when it is left without
    /// triggers.
    pub async fn replace_trigger(&self, key: &TriggerKey, trigger: Trigger) -> Result<bool> {
        self.ensure_running()?;
        trigger.validate()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.triggers.contains(key) {
            return Ok(false);
        }
        if !state.jobs.contains(&trigger.job_key) {
            return Err(StoreError::JobNotFound {
                trigger: trigger.key,
                job: trigger.job_key,
            });
        }
        if &trigger.key != key && state.triggers.contains(&trigger.key) {
            return Err(StoreError::TriggerAlreadyExists(trigger.key));
        }

        let new_key = trigger.key.clone();
        state.triggers.remove(key);
        state.triggers.add(trigger, true)?;
        let next = state.triggers.get(&new_key).and_then(|t| t.next_fire_time);
        state.flush();
        drop(guard);
        self.signaler.signal_scheduling_change(next);
        Ok(true)
    }

    /// Look up a trigger
    pub async fn retrieve_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.state.lock().await.triggers.get(key).cloned()
    }

    /// Whether a trigger is stored
    pub async fn check_trigger_exists(&self, key: &TriggerKey) -> bool {
        self.state.lock().await.triggers.contains(key)
    }

    /// Number of triggers
    pub async fn trigger_count(&self) -> usize {
        self.state.lock().await.triggers.len()
    }

    /// Trigger keys in matching groups
    pub async fn trigger_keys(&self, matcher: &GroupMatcher) -> BTreeSet<TriggerKey> {
        self.state.lock().await.triggers.keys(matcher)
    }

    /// Trigger group names
    pub async fn trigger_group_names(&self) -> BTreeSet<String> {
        self.state.lock().await.triggers.group_names()
    }

    /// Coarse state of a trigger
    pub async fn trigger_state(&self, key: &TriggerKey) -> TriggerStatus {
        self.state.lock().await.triggers.status(key)
    }

    /// Keys currently in the active queue, earliest first
    pub async fn queued_trigger_keys(&self) -> Vec<TriggerKey> {
        let state = self.state.lock().await;
        state.triggers.queue().keys().cloned().collect()
    }

    /// Bring an `ERROR` trigger back into scheduling
    pub async fn reset_trigger_from_error_state(&self, key: &TriggerKey) -> bool {
        let mut state = self.state.lock().await;
        let reset = state.triggers.reset_from_error(key);
        state.flush();
        drop(state);
        if reset {
            self.signaler.signal_scheduling_change(None);
        }
        reset
    }

    /// Pause one trigger
    pub async fn pause_trigger(&self, key: &TriggerKey) -> bool {
        let mut state = self.state.lock().await;
        let paused = state.triggers.pause(key);
        state.flush();
        paused
    }

    /// Pause triggers in matching groups; returns the groups paused
    pub async fn pause_triggers(&self, matcher: &GroupMatcher) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        let groups = state.triggers.pause_group(matcher);
        state.flush();
        groups
    }

    /// Resume one trigger
    pub async fn resume_trigger(&self, key: &TriggerKey) -> bool {
        let mut state = self.state.lock().await;
        let resumed = state.triggers.resume(key);
        state.flush();
        drop(state);
        if resumed {
            self.signaler.signal_scheduling_change(None);
        }
        resumed
    }

    /// Resume triggers in matching groups; returns the groups resumed
    pub async fn resume_triggers(&self, matcher: &GroupMatcher) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        let groups = state.triggers.resume_group(matcher);
        state.flush();
        drop(state);
        self.signaler.signal_scheduling_change(None);
        groups
    }

    /// Groups that are paused
    pub async fn paused_trigger_groups(&self) -> BTreeSet<String> {
        self.state.lock().await.triggers.paused_groups()
    }

    /// Pause every trigger, including ones added later
    pub async fn pause_all(&self) {
        let mut state = self.state.lock().await;
        state.triggers.pause_all();
        state.flush();
    }

    /// Resume every trigger
    pub async fn resume_all(&self) {
        let mut state = self.state.lock().await;
        state.triggers.resume_all();
        state.flush();
        drop(state);
        self.signaler.signal_scheduling_change(None);
    }

    // ---- firing ----

    /// Take a batch of due triggers
    ///
    /// See [`TriggerRepository::acquire_next`] for the batch rules.
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Vec<Trigger> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let jobs = &state.jobs;
        let acquired = state.triggers.acquire_next(no_later_than, max_count, time_window, |key| {
            jobs.get(key)
                .is_some_and(|job| job.concurrent_execution_disallowed)
        });
        state.flush();
        acquired
    }

    /// Put an acquired trigger back without firing it
    pub async fn release_acquired_trigger(&self, key: &TriggerKey) {
        let mut state = self.state.lock().await;
        if state.triggers.release(key) {
            state.flush();
        }
    }

    /// Record the firing of acquired triggers
    ///
    /// Triggers whose job vanished are marked `DELETED` and left out, as
    /// are triggers blocked by a running sibling.
    pub async fn triggers_fired(&self, keys: &[TriggerKey]) -> Vec<TriggerFiredBundle> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut fired = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(job_key) = state.triggers.get(key).map(|t| t.job_key.clone()) else {
                debug!(trigger = %key, "Fired trigger is gone");
                continue;
            };
            let job = state.jobs.get(&job_key);
            if let Some(bundle) = state.triggers.fire(key, job) {
                fired.push(bundle);
            }
        }
        state.flush();
        fired
    }

    /// Apply the outcome of a finished execution
    ///
    /// `job` is the job as the execution left it; its data replaces the
    /// stored data when the job persists data after execution.
    pub async fn triggered_job_complete(
        &self,
        key: &TriggerKey,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let stored = match state.jobs.get(&job.key) {
            Some(stored) => stored.clone(),
            None => {
                debug!(trigger = %key, job = %job.key, "Completed job is gone; dropping trigger");
                state.triggers.remove(key);
                state.triggers.unblock_job(&job.key);
                state.flush();
                return;
            }
        };
        if stored.persist_data_after_execution {
            let data: Map<String, Value> = job.data.clone();
            state.jobs.persist_data(&job.key, data);
        }
        state.triggers.complete(key, &stored, instruction);
        state.flush();
    }
}

/// Builder for [`SchedulerStore`]
pub struct SchedulerStoreBuilder {
    config: StoreConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    job_source: Option<Arc<dyn JobSource>>,
    cluster: Option<Arc<dyn ClusterOracle>>,
    signaler: Option<Arc<dyn SchedulerSignaler>>,
    registry: Option<Arc<StoreRegistry>>,
    listeners: Vec<Arc<dyn JobConfigListener>>,
}

impl SchedulerStoreBuilder {
    /// Create a builder
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            documents: None,
            job_source: None,
            cluster: None,
            signaler: None,
            registry: None,
            listeners: Vec::new(),
        }
    }

    /// Set the document store; defaults to an in-memory one
    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Set the job source; defaults to no jobs
    pub fn job_source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.job_source = Some(source);
        self
    }

    /// Set the cluster oracle; defaults to a single node
    pub fn cluster(mut self, cluster: Arc<dyn ClusterOracle>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the signaler; defaults to one that ignores events
    pub fn signaler(mut self, signaler: Arc<dyn SchedulerSignaler>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    /// Set the registry the store registers with
    pub fn registry(mut self, registry: Arc<StoreRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Add a job definition listener
    pub fn listener(mut self, listener: Arc<dyn JobConfigListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the store; must run inside a tokio runtime
    pub fn build(self) -> Result<Arc<SchedulerStore>> {
        self.config.validate()?;
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()));
        let signaler = self.signaler.unwrap_or_else(|| Arc::new(NoopSignaler));
        let writer = PersistenceWriter::start(documents.clone(), self.config.doc_id_prefix.clone());

        let mut jobs = JobRepository::new();
        for listener in self.listeners {
            jobs.add_listener(listener);
        }
        let triggers = TriggerRepository::new(
            self.config.node_id.clone(),
            self.config.misfire_threshold(),
            writer.clone(),
            signaler.clone(),
        );
        let recovery = RecoveryCoordinator::new(self.config.recovery_interval());

        Ok(Arc::new_cyclic(|this| SchedulerStore {
            config: self.config,
            state: Mutex::new(StoreState { jobs, triggers }),
            documents,
            writer,
            cluster: self.cluster.unwrap_or_else(|| Arc::new(SingleNode)),
            signaler,
            job_source: self
                .job_source
                .unwrap_or_else(|| Arc::new(StaticJobSource::default())),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(StoreRegistry::new())),
            recovery,
            reload: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        }))
    }
}
