//! Hourglass Core - Clustered Scheduling Store
//!
//! This crate provides the storage side of a cron-like job scheduler that
//! runs on several cooperating nodes:
//! - Scheduler: jobs, triggers, the trigger state machine and the store facade
//! - Documents: durable per-trigger state (in-memory and SQLite backends)
//! - Shutdown: coordinated shutdown of a scheduler node

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod documents;
pub mod error;
pub mod scheduler;
pub mod shutdown;

pub use documents::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore};
pub use error::{Result, StoreError};
pub use scheduler::{
    CompletedExecutionInstruction, GroupMatcher, JobAction, JobConfig, JobDetail, JobKey,
    MisfirePolicy, Schedule, SchedulerStore, StoreConfig, StoreRegistry, Trigger, TriggerKey,
    TriggerState,
};
pub use shutdown::{ShutdownController, ShutdownPhase};
