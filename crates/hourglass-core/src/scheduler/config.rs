//! Scheduler store configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Default misfire threshold in milliseconds
pub const DEFAULT_MISFIRE_THRESHOLD_MS: u64 = 5000;

/// Default delay between recovery passes in seconds
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 10;

/// Default bound on shutdown draining in seconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Default cluster health wait at startup in milliseconds
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 1000;

/// Configuration of one scheduler store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name of the scheduler instance
    pub scheduler_name: String,
    /// Id of the local cluster node
    pub node_id: String,
    /// Prefix of trigger document ids
    pub doc_id_prefix: Option<String>,
    /// How late a trigger may be before it counts as misfired, in milliseconds
    pub misfire_threshold_ms: u64,
    /// Delay between recovery passes, in seconds
    pub recovery_interval_secs: u64,
    /// Bound on draining background work at shutdown, in seconds
    pub shutdown_timeout_secs: u64,
    /// Cluster health wait at startup, in milliseconds
    pub health_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            scheduler_name: "default".to_string(),
            node_id: "node-1".to_string(),
            doc_id_prefix: None,
            misfire_threshold_ms: DEFAULT_MISFIRE_THRESHOLD_MS,
            recovery_interval_secs: DEFAULT_RECOVERY_INTERVAL_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for a named scheduler on a node
    pub fn new(scheduler_name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Set document id prefix
    pub fn with_doc_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.doc_id_prefix = Some(prefix.into());
        self
    }

    /// Set misfire threshold
    pub fn with_misfire_threshold(mut self, threshold: Duration) -> Self {
        self.misfire_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Set recovery interval
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval_secs = interval.as_secs();
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_secs = timeout.as_secs();
        self
    }

    /// Set cluster health timeout
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Misfire threshold
    pub fn misfire_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.misfire_threshold_ms as i64)
    }

    /// Recovery interval
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    /// Shutdown timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Cluster health timeout
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.scheduler_name.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "scheduler_name must not be empty".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "node_id must not be empty".to_string(),
            ));
        }
        if self.recovery_interval_secs == 0 {
            return Err(StoreError::InvalidConfig(
                "recovery_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.misfire_threshold(), chrono::Duration::milliseconds(5000));
        assert_eq!(config.recovery_interval(), Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = StoreConfig::new("reports", "node-7")
            .with_doc_id_prefix("sched")
            .with_misfire_threshold(Duration::from_millis(250))
            .with_recovery_interval(Duration::from_secs(2));
        assert_eq!(config.scheduler_name, "reports");
        assert_eq!(config.doc_id_prefix.as_deref(), Some("sched"));
        assert_eq!(config.misfire_threshold_ms, 250);
        assert_eq!(config.recovery_interval_secs, 2);
    }

    #[test]
    fn test_validate_rejects_blank_node() {
        let config = StoreConfig::new("reports", " ");
        assert!(matches!(config.validate(), Err(StoreError::InvalidConfig(_))));
    }
}
