//! Error types for hourglass-core
//!
//! Rejections a caller must handle (duplicate keys, dangling job references)
//! are kept distinct from backend failures so callers can tell them apart.

use thiserror::Error;

use crate::scheduler::{JobKey, TriggerKey};

/// Store error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// A job with the same key is already stored
    #[error("job already exists: {0}")]
    JobAlreadyExists(JobKey),

    /// A trigger with the same key is already stored
    #[error("trigger already exists: {0}")]
    TriggerAlreadyExists(TriggerKey),

    /// A trigger references a job that is not stored
    #[error("trigger {trigger} references unknown job {job}")]
    JobNotFound {
        /// Trigger being stored
        trigger: TriggerKey,
        /// Missing job
        job: JobKey,
    },

    /// No trigger with the given key
    #[error("trigger not found: {0}")]
    TriggerNotFound(TriggerKey),

    /// Schedule could not be built or evaluated
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Document store failure
    #[error("document store error: {0}")]
    Document(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cluster health or peer call failure
    #[error("cluster error: {0}")]
    Cluster(String),

    /// The store has been shut down
    #[error("store is shutting down")]
    ShuttingDown,
}

impl StoreError {
    /// Whether this is a duplicate-key rejection
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Self::JobAlreadyExists(_) | Self::TriggerAlreadyExists(_)
        )
    }

    /// Whether this is a referential integrity rejection
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::JobNotFound { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StoreError>;
