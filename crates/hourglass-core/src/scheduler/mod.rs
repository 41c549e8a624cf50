//! Clustered job and trigger store
//!
//! Backing store for a cron-like scheduling engine. It owns the trigger
//! lifecycle, orders what fires next, keeps non-concurrent jobs from
//! overlapping and persists trigger state so another node can take over.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  SchedulerStore  │  One lock per scheduler instance
//! └────────┬─────────┘
//!          │
//!    ┌─────┴──────────────┐
//!    ▼                    ▼
//! ┌──────────────┐  ┌───────────────────┐
//! │JobRepository │  │ TriggerRepository │  State machine + active queue
//! └──────────────┘  └─────────┬─────────┘
//!                             │ dirty keys
//!                             ▼
//!                   ┌───────────────────┐
//!                   │ PersistenceWriter │  Background bulk writes
//!                   └─────────┬─────────┘
//!                             ▼
//!                   ┌───────────────────┐
//!                   │   DocumentStore   │
//!                   └───────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hourglass_core::scheduler::{
//!     JobAction, JobDetail, JobKey, Schedule, SchedulerStore, StoreConfig, Trigger, TriggerKey,
//! };
//!
//! let store = SchedulerStore::builder(StoreConfig::new("reports", "node-1"))
//!     .documents(documents)
//!     .build()?;
//! store.initialize().await?;
//!
//! let job = JobDetail::new(JobKey::new("reports", "nightly"), JobAction::Log {
//!     message: "building report".into(),
//! });
//! let trigger = Trigger::new(
//!     TriggerKey::new("reports", "nightly"),
//!     job.key.clone(),
//!     Schedule::cron("0 0 3 * * *")?,
//! );
//! store.store_job_and_trigger(job, trigger).await?;
//! ```

mod active_queue;
mod cluster;
mod config;
mod job;
mod job_repository;
mod keys;
mod persistence;
mod recovery;
mod registry;
mod schedule;
mod signaler;
mod store;
mod trigger;
mod trigger_repository;

pub use active_queue::{ActiveTriggerEntry, ActiveTriggerQueue};
pub use cluster::{ClusterHealth, ClusterOracle, LocalCluster, SingleNode};
pub use config::StoreConfig;
pub use job::{
    JobAction, JobConfig, JobConfigListener, JobDetail, JobSource, StaticJobSource, UpdateSummary,
    UNVERSIONED,
};
pub use job_repository::JobRepository;
pub use keys::{GroupMatcher, JobKey, TriggerKey, DEFAULT_GROUP};
pub use persistence::{DirtySet, PersistenceWriter, TriggerWrite};
pub use recovery::RecoveryCoordinator;
pub use registry::StoreRegistry;
pub use schedule::{
    CronSchedule, DailySchedule, FireWindow, IntervalSchedule, MisfirePolicy, OnceSchedule,
    Schedule,
};
pub use signaler::{NoopSignaler, NotifySignaler, SchedulerSignaler};
pub use store::{SchedulerStore, SchedulerStoreBuilder};
pub use trigger::{
    CompletedExecutionInstruction, Trigger, TriggerDocument, TriggerState, TriggerStatus,
    DEFAULT_PRIORITY,
};
pub use trigger_repository::{LoadedState, TriggerFiredBundle, TriggerRepository};
