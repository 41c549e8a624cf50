//! In-memory job definitions

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use super::job::{JobConfig, JobConfigListener, JobDetail, JobSource};
use super::keys::{GroupMatcher, JobKey};
use crate::error::{Result, StoreError};

/// Map of job identity to definition
#[derive(Default)]
pub struct JobRepository {
    jobs: HashMap<JobKey, JobDetail>,
    listeners: Vec<Arc<dyn JobConfigListener>>,
}

impl JobRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for load and update notifications
    pub fn add_listener(&mut self, listener: Arc<dyn JobConfigListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn listeners(&self) -> &[Arc<dyn JobConfigListener>] {
        &self.listeners
    }

    /// Read every job definition from a source
    ///
    /// A failing source yields an empty set; the store starts without jobs.
    pub async fn load(&mut self, source: &dyn JobSource) -> Vec<JobConfig> {
        let started = Instant::now();
        let configs = match source.load_jobs().await {
            Ok(configs) => configs,
            Err(e) => {
                error!(
                    "Loading jobs failed after {}ms: {}",
                    started.elapsed().as_millis(),
                    e
                );
                Vec::new()
            }
        };

        for config in &configs {
            self.jobs.insert(config.job.key.clone(), config.job.clone());
        }
        for listener in &self.listeners {
            listener.on_init(&configs);
        }
        info!(
            "Loaded {} jobs in {}ms",
            configs.len(),
            started.elapsed().as_millis()
        );
        configs
    }

    /// Store a job
    pub fn insert(&mut self, job: JobDetail, replace: bool) -> Result<()> {
        if !replace && self.jobs.contains_key(&job.key) {
            return Err(StoreError::JobAlreadyExists(job.key));
        }
        debug!(job = %job.key, "Storing job");
        self.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    /// Remove a job
    pub fn remove(&mut self, key: &JobKey) -> Option<JobDetail> {
        self.jobs.remove(key)
    }

    /// Look up a job
    pub fn get(&self, key: &JobKey) -> Option<&JobDetail> {
        self.jobs.get(key)
    }

    /// Whether a job is stored
    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is stored
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Keys whose group matches
    pub fn keys(&self, matcher: &GroupMatcher) -> BTreeSet<JobKey> {
        self.jobs
            .keys()
            .filter(|key| matcher.matches(key.group()))
            .cloned()
            .collect()
    }

    /// Distinct group names
    pub fn group_names(&self) -> BTreeSet<String> {
        self.jobs.keys().map(|key| key.group().to_string()).collect()
    }

    /// Replace a job's data after an execution, when the job asks for it
    pub fn persist_data(&mut self, key: &JobKey, data: Map<String, Value>) -> bool {
        match self.jobs.get_mut(key) {
            Some(job) if job.persist_data_after_execution => {
                job.data = data;
                true
            }
            _ => false,
        }
    }

    /// Remove every job
    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobAction, StaticJobSource};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn job(group: &str, name: &str) -> JobDetail {
        JobDetail::new(JobKey::new(group, name), JobAction::Named { name: "noop".into() })
    }

    struct FailingSource;

    #[async_trait]
    impl JobSource for FailingSource {
        async fn load_jobs(&self) -> Result<Vec<JobConfig>> {
            Err(StoreError::Document("index unavailable".into()))
        }
    }

    #[derive(Default)]
    struct CountingListener {
        seen: Mutex<Vec<usize>>,
    }

    impl JobConfigListener for CountingListener {
        fn on_init(&self, jobs: &[JobConfig]) {
            self.seen.lock().unwrap().push(jobs.len());
        }
    }

    #[test]
    fn test_insert_rejects_duplicates_without_replace() {
        let mut repo = JobRepository::new();
        repo.insert(job("g", "a"), false).unwrap();
        let err = repo.insert(job("g", "a"), false).unwrap_err();
        assert!(err.is_already_exists());
        repo.insert(job("g", "a").durable(true), true).unwrap();
        assert!(repo.get(&JobKey::new("g", "a")).unwrap().durable);
    }

    #[test]
    fn test_keys_and_groups() {
        let mut repo = JobRepository::new();
        repo.insert(job("reports", "a"), false).unwrap();
        repo.insert(job("reports", "b"), false).unwrap();
        repo.insert(job("alerts", "c"), false).unwrap();

        assert_eq!(repo.keys(&GroupMatcher::group("reports")).len(), 2);
        assert_eq!(
            repo.group_names().into_iter().collect::<Vec<_>>(),
            vec!["alerts".to_string(), "reports".to_string()]
        );
    }

    #[test]
    fn test_persist_data_only_when_flagged() {
        let mut repo = JobRepository::new();
        repo.insert(job("g", "plain"), false).unwrap();
        repo.insert(job("g", "sticky").persist_data_after_execution(true), false)
            .unwrap();

        let mut data = Map::new();
        data.insert("count".into(), json!(3));
        assert!(!repo.persist_data(&JobKey::new("g", "plain"), data.clone()));
        assert!(repo.persist_data(&JobKey::new("g", "sticky"), data));
        assert_eq!(repo.get(&JobKey::new("g", "sticky")).unwrap().data["count"], 3);
    }

    #[tokio::test]
    async fn test_load_notifies_listeners() {
        let mut repo = JobRepository::new();
        let listener = Arc::new(CountingListener::default());
        repo.add_listener(listener.clone());

        let source = StaticJobSource::new(vec![JobConfig::new(job("g", "a"), vec![])]);
        let configs = repo.load(&source).await;

        assert_eq!(configs.len(), 1);
        assert!(repo.contains(&JobKey::new("g", "a")));
        assert_eq!(*listener.seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_failed_load_continues_empty() {
        let mut repo = JobRepository::new();
        let configs = repo.load(&FailingSource).await;
        assert!(configs.is_empty());
        assert!(repo.is_empty());
    }
}
