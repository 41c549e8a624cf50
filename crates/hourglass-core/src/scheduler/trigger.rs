//! Triggers - one firing rule for a job plus its scheduling state
//!
//! A trigger carries its definition (schedule, misfire policy, window),
//! the fire-time bookkeeping advanced by each firing, and the cluster
//! state that is persisted as a [`TriggerDocument`].

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::keys::{JobKey, TriggerKey};
use super::schedule::{FireWindow, MisfirePolicy, Schedule};
use crate::error::Result;

/// Default trigger priority
pub const DEFAULT_PRIORITY: i32 = 5;

/// Scheduling state of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    /// Queued, eligible to fire
    Waiting,
    /// Handed to the engine, not yet fired
    Acquired,
    /// Its job is running
    Executing,
    /// Held back while a sibling runs a non-concurrent job
    Blocked,
    /// Paused by an administrator
    Paused,
    /// Paused and blocked at the same time
    PausedBlocked,
    /// No further fire times
    Complete,
    /// Failed; needs a reset
    Error,
    /// Pending removal from the document store
    Deleted,
}

impl TriggerState {
    /// State reported to callers of the store
    pub fn status(self) -> TriggerStatus {
        match self {
            Self::Waiting | Self::Acquired | Self::Executing | Self::Deleted => {
                TriggerStatus::Normal
            }
            Self::Blocked => TriggerStatus::Blocked,
            Self::Paused | Self::PausedBlocked => TriggerStatus::Paused,
            Self::Complete => TriggerStatus::Complete,
            Self::Error => TriggerStatus::Error,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
            Self::PausedBlocked => "PAUSED_BLOCKED",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Coarse trigger state exposed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Unknown trigger
    None,
    /// Scheduled normally
    Normal,
    /// Paused
    Paused,
    /// Finished
    Complete,
    /// In error
    Error,
    /// Blocked by a running sibling
    Blocked,
}

/// Outcome the engine reports after running a fired trigger's job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Keep scheduling normally
    NoInstruction,
    /// The trigger is done
    SetTriggerComplete,
    /// Remove the trigger
    DeleteTrigger,
    /// Every trigger of the job is done
    SetAllJobTriggersComplete,
    /// The trigger failed
    SetTriggerError,
    /// Every trigger of the job failed
    SetAllJobTriggersError,
}

/// Persisted cluster state of one trigger
///
/// Absent optional fields were never set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDocument {
    /// Node that last owned the trigger
    pub node: String,
    /// Scheduling state
    pub state: TriggerState,
    /// Diagnostic text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Next fire time, epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<i64>,
    /// Previous fire time, epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_fire_time: Option<i64>,
    /// Number of firings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub times_triggered: Option<u32>,
}

/// A scheduled firing rule bound to one job
#[derive(Debug, Clone)]
pub struct Trigger {
    /// Trigger identity
    pub key: TriggerKey,
    /// Job fired by this trigger
    pub job_key: JobKey,
    /// Human-readable description
    pub description: Option<String>,
    /// Tie-breaker between triggers due at the same time (higher first)
    pub priority: i32,
    /// Fire-time rule
    pub schedule: Schedule,
    /// Misfire handling
    pub misfire_policy: MisfirePolicy,
    /// Earliest fire time
    pub start_time: DateTime<Utc>,
    /// Latest fire time
    pub end_time: Option<DateTime<Utc>>,
    /// Upcoming fire time
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Last fire time
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Number of firings so far
    pub times_triggered: u32,
    /// Scheduling state
    pub state: TriggerState,
    /// Diagnostic text, set when persisted state could not be read
    pub state_info: Option<String>,
    /// Node currently holding the trigger
    pub node: String,
    /// Token of the current firing attempt
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    /// Create a trigger starting now
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            priority: DEFAULT_PRIORITY,
            schedule,
            misfire_policy: MisfirePolicy::default(),
            start_time: Utc::now().trunc_subsecs(3),
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            state: TriggerState::Waiting,
            state_info: None,
            node: String::new(),
            fire_instance_id: None,
        }
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set misfire policy
    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    /// Set start time
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = start.trunc_subsecs(3);
        self
    }

    /// Set end time
    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end.trunc_subsecs(3));
        self
    }

    /// Validate the definition
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()
    }

    fn window(&self) -> FireWindow {
        FireWindow {
            start: self.start_time,
            end: self.end_time,
        }
    }

    /// Set the next fire time to the first occurrence of the schedule
    pub fn compute_first_fire_time(&mut self) -> Option<DateTime<Utc>> {
        self.next_fire_time = self.schedule.first_fire_time(&self.window());
        self.next_fire_time
    }

    /// Advance the schedule past the current fire time
    pub fn triggered(&mut self) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = self
            .next_fire_time
            .and_then(|current| self.schedule.fire_time_after(current, &self.window()));
    }

    /// Whether misfires are handled at all
    pub fn ignores_misfires(&self) -> bool {
        self.misfire_policy == MisfirePolicy::IgnoreMisfires
    }

    /// Reschedule after a missed fire time
    pub fn update_after_misfire(&mut self, now: DateTime<Utc>) {
        self.next_fire_time = self.schedule.next_after_misfire(
            self.misfire_policy,
            self.next_fire_time,
            now,
            &self.window(),
        );
    }

    /// What the engine should report once the job of this firing finishes
    pub fn execution_complete_instruction(&self) -> CompletedExecutionInstruction {
        if self.next_fire_time.is_none() {
            CompletedExecutionInstruction::SetTriggerComplete
        } else {
            CompletedExecutionInstruction::NoInstruction
        }
    }

    /// Whether two triggers have the same definition, ignoring state
    pub fn same_definition(&self, other: &Trigger) -> bool {
        self.key == other.key
            && self.job_key == other.job_key
            && self.description == other.description
            && self.priority == other.priority
            && self.schedule == other.schedule
            && self.misfire_policy == other.misfire_policy
            && self.start_time == other.start_time
            && self.end_time == other.end_time
    }

    /// Persisted representation of the cluster state
    pub fn document(&self) -> TriggerDocument {
        TriggerDocument {
            node: self.node.clone(),
            state: self.state,
            state_info: self.state_info.clone(),
            next_fire_time: self.next_fire_time.map(|t| t.timestamp_millis()),
            previous_fire_time: self.previous_fire_time.map(|t| t.timestamp_millis()),
            times_triggered: (self.times_triggered > 0).then_some(self.times_triggered),
        }
    }

    /// Overwrite cluster state from a persisted document
    ///
    /// A document that does not parse leaves the trigger in `ERROR` with a
    /// diagnostic in `state_info`; it stays visible and can be reset.
    pub fn apply_document(&mut self, source: &Value) {
        match serde_json::from_value::<TriggerDocument>(source.clone()) {
            Ok(doc) => {
                self.node = doc.node;
                self.state = doc.state;
                self.state_info = doc.state_info;
                self.next_fire_time = doc.next_fire_time.and_then(from_millis);
                self.previous_fire_time = doc.previous_fire_time.and_then(from_millis);
                self.times_triggered = doc.times_triggered.unwrap_or(0);
            }
            Err(e) => {
                self.state = TriggerState::Error;
                self.state_info = Some(format!("error while parsing trigger state: {}", e));
            }
        }
    }
}

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests;
