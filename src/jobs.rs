//! Job definitions read from `[[jobs]]` configuration tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourglass_core::scheduler::{
    JobAction, JobConfig, JobDetail, JobKey, JobSource, MisfirePolicy, Schedule, Trigger,
    TriggerKey, DEFAULT_GROUP, DEFAULT_PRIORITY, UNVERSIONED,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_version() -> i64 {
    UNVERSIONED
}

/// One `[[jobs]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_group")]
    pub group: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub action: JobAction,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub persist_data_after_execution: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub requests_recovery: bool,
    #[serde(default)]
    pub triggers: Vec<TriggerSettings>,
}

/// One `[[jobs.triggers]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub name: String,
    /// Defaults to the job's group
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub schedule: Schedule,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
}

impl JobSettings {
    /// Build the job and its triggers, validating every schedule
    pub fn to_job_config(&self) -> hourglass_core::Result<JobConfig> {
        let mut job = JobDetail::new(JobKey::new(&self.group, &self.name), self.action.clone())
            .with_version(self.version)
            .durable(self.durable)
            .persist_data_after_execution(self.persist_data_after_execution)
            .concurrent_execution_disallowed(self.concurrent_execution_disallowed)
            .requests_recovery(self.requests_recovery);
        if let Some(description) = &self.description {
            job = job.with_description(description);
        }
        job.data = self.data.clone();

        let triggers = self
            .triggers
            .iter()
            .map(|settings| {
                let group = settings.group.as_deref().unwrap_or(&self.group);
                let mut trigger = Trigger::new(
                    TriggerKey::new(group, &settings.name),
                    job.key.clone(),
                    settings.schedule.clone(),
                )
                .with_priority(settings.priority)
                .with_misfire_policy(settings.misfire_policy);
                if let Some(description) = &settings.description {
                    trigger = trigger.with_description(description);
                }
                if let Some(start) = settings.start_at {
                    trigger = trigger.starting_at(start);
                }
                if let Some(end) = settings.end_at {
                    trigger = trigger.ending_at(end);
                }
                trigger.validate()?;
                Ok(trigger)
            })
            .collect::<hourglass_core::Result<Vec<_>>>()?;

        Ok(JobConfig::new(job, triggers))
    }
}

/// Supplies the jobs of the node configuration
pub struct ConfigJobSource {
    jobs: Vec<JobSettings>,
}

impl ConfigJobSource {
    pub fn new(jobs: Vec<JobSettings>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobSource for ConfigJobSource {
    async fn load_jobs(&self) -> hourglass_core::Result<Vec<JobConfig>> {
        Ok(self
            .jobs
            .iter()
            .filter_map(|settings| match settings.to_job_config() {
                Ok(config) => Some(config),
                Err(e) => {
                    error!(group = %settings.group, name = %settings.name, "Skipping job: {}", e);
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(schedule: Value) -> JobSettings {
        serde_json::from_value(json!({
            "group": "reports",
            "name": "nightly",
            "action": { "type": "shell", "command": "make report" },
            "data": { "format": "pdf" },
            "concurrent_execution_disallowed": true,
            "triggers": [
                { "name": "at-three", "schedule": schedule, "priority": 7 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_job_settings_build_job_config() {
        let config = settings(json!({ "type": "cron", "expression": "0 0 3 * * *" }))
            .to_job_config()
            .unwrap();

        assert_eq!(config.job.key, JobKey::new("reports", "nightly"));
        assert!(config.job.concurrent_execution_disallowed);
        assert!(!config.job.durable);
        assert_eq!(config.job.version, UNVERSIONED);
        assert_eq!(config.job.data["format"], "pdf");

        assert_eq!(config.triggers.len(), 1);
        let trigger = &config.triggers[0];
        assert_eq!(trigger.key, TriggerKey::new("reports", "at-three"));
        assert_eq!(trigger.job_key, config.job.key);
        assert_eq!(trigger.priority, 7);
        assert_eq!(trigger.misfire_policy, MisfirePolicy::Smart);
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let err = settings(json!({ "type": "cron", "expression": "not a cron" }))
            .to_job_config()
            .unwrap_err();
        assert!(err.to_string().contains("invalid schedule"));
    }

    #[tokio::test]
    async fn test_source_skips_invalid_jobs() {
        let source = ConfigJobSource::new(vec![
            settings(json!({ "type": "interval", "every_ms": 60000 })),
            settings(json!({ "type": "interval", "every_ms": 0 })),
        ]);
        let jobs = source.load_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
