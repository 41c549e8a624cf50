//! Job definitions and the sources that supply them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::keys::JobKey;
use super::trigger::Trigger;
use crate::error::Result;

/// Version of a job that does not track versions
pub const UNVERSIONED: i64 = -1;

/// What a job runs when fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobAction {
    /// Emit a log line
    Log {
        /// Message to log
        message: String,
    },
    /// Execute a shell command
    Shell {
        /// Command to execute
        command: String,
        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Resolved by the embedding engine
    Named {
        /// Executable name
        name: String,
    },
}

/// A unit of work fired by triggers
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetail {
    /// Job identity
    pub key: JobKey,
    /// Description
    pub description: Option<String>,
    /// Executable reference
    pub action: JobAction,
    /// Arbitrary payload handed to each execution
    pub data: Map<String, Value>,
    /// Definition version, or [`UNVERSIONED`]
    pub version: i64,
    /// Keep the job when it has no triggers left
    pub durable: bool,
    /// Replace `data` with the payload returned by each execution
    pub persist_data_after_execution: bool,
    /// Never run two firings of this job at once
    pub concurrent_execution_disallowed: bool,
    /// Re-run after a crash of the executing node
    pub requests_recovery: bool,
}

impl JobDetail {
    /// Create a non-durable, concurrency-allowed job
    pub fn new(key: JobKey, action: JobAction) -> Self {
        Self {
            key,
            description: None,
            action,
            data: Map::new(),
            version: UNVERSIONED,
            durable: false,
            persist_data_after_execution: false,
            concurrent_execution_disallowed: false,
            requests_recovery: false,
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add one data entry
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Set version
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Set durability
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Set whether data is persisted after execution
    pub fn persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    /// Set whether concurrent execution is disallowed
    pub fn concurrent_execution_disallowed(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    /// Set whether the job requests recovery
    pub fn requests_recovery(mut self, requests: bool) -> Self {
        self.requests_recovery = requests;
        self
    }

    /// Whether both sides carry a version
    pub fn is_versioned(&self) -> bool {
        self.version >= 0
    }
}

/// A job together with its trigger definitions
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Job definition
    pub job: JobDetail,
    /// Triggers firing the job
    pub triggers: Vec<Trigger>,
}

impl JobConfig {
    /// Bundle a job with triggers
    pub fn new(job: JobDetail, triggers: Vec<Trigger>) -> Self {
        Self { job, triggers }
    }

    /// Whether `other` differs from this definition
    pub fn differs_from(&self, other: &JobConfig) -> bool {
        if self.job.is_versioned() && other.job.is_versioned() {
            return self.job.version != other.job.version;
        }
        if self.job != other.job || self.triggers.len() != other.triggers.len() {
            return true;
        }
        !self
            .triggers
            .iter()
            .all(|t| other.triggers.iter().any(|o| t.same_definition(o)))
    }
}

/// Changes applied by a job update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// New jobs
    pub added: Vec<JobKey>,
    /// Changed jobs
    pub updated: Vec<JobKey>,
    /// Removed jobs
    pub deleted: Vec<JobKey>,
}

impl UpdateSummary {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Supplies job definitions to load
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Every job definition with its triggers
    async fn load_jobs(&self) -> Result<Vec<JobConfig>>;
}

/// Fixed list of job definitions
#[derive(Debug, Clone, Default)]
pub struct StaticJobSource {
    jobs: Vec<JobConfig>,
}

impl StaticJobSource {
    /// Create a source from definitions
    pub fn new(jobs: Vec<JobConfig>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobSource for StaticJobSource {
    async fn load_jobs(&self) -> Result<Vec<JobConfig>> {
        Ok(self.jobs.clone())
    }
}

/// Observer of job definition changes
pub trait JobConfigListener: Send + Sync {
    /// Called once per load with the full set
    fn on_init(&self, jobs: &[JobConfig]);

    /// Called before an update is applied
    fn before_change(&self, _update: &UpdateSummary) {}

    /// Called after an update is applied
    fn after_change(&self, _update: &UpdateSummary) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::keys::TriggerKey;
    use crate::scheduler::schedule::Schedule;
    use chrono::Duration;

    fn config(version: i64, every_secs: i64) -> JobConfig {
        let key = JobKey::new("g", "j");
        let job = JobDetail::new(key.clone(), JobAction::Log { message: "hi".into() })
            .with_version(version);
        let trigger = Trigger::new(
            TriggerKey::new("g", "t"),
            key,
            Schedule::interval(Duration::seconds(every_secs)),
        );
        JobConfig::new(job, vec![trigger])
    }

    #[test]
    fn test_versioned_jobs_compare_by_version() {
        let a = config(1, 10);
        let mut b = config(1, 20);
        b.triggers[0].start_time = a.triggers[0].start_time;
        assert!(!a.differs_from(&b));
        assert!(a.differs_from(&config(2, 10)));
    }

    #[test]
    fn test_unversioned_jobs_compare_by_definition() {
        let a = config(UNVERSIONED, 10);
        let mut same = config(UNVERSIONED, 10);
        same.triggers[0].start_time = a.triggers[0].start_time;
        assert!(!a.differs_from(&same));

        let mut changed = same.clone();
        changed.job.durable = true;
        assert!(a.differs_from(&changed));
    }

    #[test]
    fn test_action_serde() {
        let action: JobAction =
            serde_json::from_str(r#"{"type":"shell","command":"echo hi"}"#).unwrap();
        assert_eq!(
            action,
            JobAction::Shell { command: "echo hi".into(), cwd: None }
        );
    }
}
