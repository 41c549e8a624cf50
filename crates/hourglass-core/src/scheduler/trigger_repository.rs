//! Trigger lifecycle
//!
//! Owns every trigger of a scheduler instance and drives the state machine:
//! add/remove, pause/resume, acquisition, firing, completion, misfire
//! handling and blocking of non-concurrent jobs. The active queue holds a
//! trigger exactly while it is `WAITING`.
//!
//! Callers serialize access (the facade holds one lock around the whole
//! repository), so no method here synchronizes on its own.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::active_queue::ActiveTriggerQueue;
use super::job::JobDetail;
use super::keys::{GroupMatcher, JobKey, TriggerKey};
use super::persistence::{PersistenceWriter, TriggerWrite};
use super::signaler::SchedulerSignaler;
use super::trigger::{CompletedExecutionInstruction, Trigger, TriggerState, TriggerStatus};
use crate::error::{Result, StoreError};

/// Everything the engine needs to run one firing
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    /// Job to run
    pub job: JobDetail,
    /// Trigger state after the firing was recorded
    pub trigger: Trigger,
    /// When the firing was recorded
    pub fire_time: DateTime<Utc>,
    /// Fire time the trigger was scheduled for
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    /// Fire time before this one
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Fire time after this one
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Persisted state found for a trigger at load time
#[derive(Debug, Clone)]
pub enum LoadedState {
    /// A document exists
    Found(Value),
    /// Never persisted
    Missing,
    /// The read failed
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Misfire {
    None,
    Rescheduled,
    Completed,
}

/// Trigger map, active queue and auxiliary indices
pub struct TriggerRepository {
    node: String,
    misfire_threshold: Duration,
    triggers: HashMap<TriggerKey, Trigger>,
    by_job: HashMap<JobKey, BTreeSet<TriggerKey>>,
    queue: ActiveTriggerQueue,
    blocked_jobs: HashSet<JobKey>,
    paused_triggers: HashSet<TriggerKey>,
    paused_groups: HashSet<String>,
    writer: Arc<PersistenceWriter>,
    signaler: Arc<dyn SchedulerSignaler>,
}

impl TriggerRepository {
    /// Create an empty repository owned by `node`
    pub fn new(
        node: impl Into<String>,
        misfire_threshold: Duration,
        writer: Arc<PersistenceWriter>,
        signaler: Arc<dyn SchedulerSignaler>,
    ) -> Self {
        Self {
            node: node.into(),
            misfire_threshold,
            triggers: HashMap::new(),
            by_job: HashMap::new(),
            queue: ActiveTriggerQueue::new(),
            blocked_jobs: HashSet::new(),
            paused_triggers: HashSet::new(),
            paused_groups: HashSet::new(),
            writer,
            signaler,
        }
    }

    /// Local node id
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Active queue, for inspection
    pub fn queue(&self) -> &ActiveTriggerQueue {
        &self.queue
    }

    /// Whether a trigger is stored
    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.triggers.contains_key(key)
    }

    /// Look up a trigger
    pub fn get(&self, key: &TriggerKey) -> Option<&Trigger> {
        self.triggers.get(key)
    }

    /// Number of triggers
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether no trigger is stored
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Every trigger
    pub fn iter(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.values()
    }

    /// Keys of a job's triggers
    pub fn keys_for_job(&self, job: &JobKey) -> Vec<TriggerKey> {
        self.by_job
            .get(job)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A job's triggers
    pub fn for_job(&self, job: &JobKey) -> Vec<&Trigger> {
        self.by_job
            .get(job)
            .into_iter()
            .flatten()
            .filter_map(|key| self.triggers.get(key))
            .collect()
    }

    /// Whether a job currently has triggers
    pub fn has_triggers(&self, job: &JobKey) -> bool {
        self.by_job.get(job).is_some_and(|keys| !keys.is_empty())
    }

    /// Keys whose group matches
    pub fn keys(&self, matcher: &GroupMatcher) -> BTreeSet<TriggerKey> {
        self.triggers
            .keys()
            .filter(|key| matcher.matches(key.group()))
            .cloned()
            .collect()
    }

    /// Distinct group names
    pub fn group_names(&self) -> BTreeSet<String> {
        self.triggers
            .keys()
            .map(|key| key.group().to_string())
            .collect()
    }

    /// Whether a job is blocked by a running sibling
    pub fn is_job_blocked(&self, job: &JobKey) -> bool {
        self.blocked_jobs.contains(job)
    }

    /// Coarse state of a trigger
    pub fn status(&self, key: &TriggerKey) -> TriggerStatus {
        self.triggers
            .get(key)
            .map_or(TriggerStatus::None, |t| t.state.status())
    }

    /// Groups with paused triggers, plus groups paused as a whole
    pub fn paused_groups(&self) -> BTreeSet<String> {
        self.paused_triggers
            .iter()
            .map(|key| key.group().to_string())
            .chain(self.paused_groups.iter().cloned())
            .collect()
    }

    /// Keys of the given set that are executing on this node
    pub fn executing_here(&self, keys: &HashSet<TriggerKey>) -> HashSet<TriggerKey> {
        keys.iter()
            .filter(|key| {
                self.triggers
                    .get(*key)
                    .is_some_and(|t| t.state == TriggerState::Executing && t.node == self.node)
            })
            .cloned()
            .collect()
    }

    fn attach(&mut self, trigger: Trigger) {
        self.by_job
            .entry(trigger.job_key.clone())
            .or_default()
            .insert(trigger.key.clone());
        self.triggers.insert(trigger.key.clone(), trigger);
    }

    fn detach(&mut self, key: &TriggerKey) -> Option<Trigger> {
        let trigger = self.triggers.remove(key)?;
        if let Some(keys) = self.by_job.get_mut(&trigger.job_key) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_job.remove(&trigger.job_key);
            }
        }
        self.queue.remove(key);
        self.paused_triggers.remove(key);
        Some(trigger)
    }

    fn mark_dirty(&self, key: &TriggerKey) {
        self.writer.mark_dirty(key);
    }

    /// Mark every trigger dirty
    pub fn mark_all_dirty(&self) {
        for key in self.triggers.keys() {
            self.writer.mark_dirty(key);
        }
    }

    /// Move a trigger to `WAITING`, or `BLOCKED` if its job is blocked
    ///
    /// Returns whether the trigger ended up queued.
    fn to_idle(&mut self, key: &TriggerKey) -> bool {
        let Some(trigger) = self.triggers.get_mut(key) else {
            return false;
        };
        let blocked = self.blocked_jobs.contains(&trigger.job_key);
        self.paused_triggers.remove(key);
        if blocked {
            trigger.state = TriggerState::Blocked;
            self.queue.remove(key);
        } else {
            trigger.state = TriggerState::Waiting;
            self.queue.insert(trigger);
        }
        self.writer.mark_dirty(key);
        !blocked
    }

    fn set_paused(&mut self, key: &TriggerKey) {
        let Some(trigger) = self.triggers.get_mut(key) else {
            return;
        };
        trigger.state = if self.blocked_jobs.contains(&trigger.job_key) {
            TriggerState::PausedBlocked
        } else {
            TriggerState::Paused
        };
        self.queue.remove(key);
        self.paused_triggers.insert(key.clone());
        self.writer.mark_dirty(key);
    }

    fn finalize(&mut self, key: &TriggerKey, state: TriggerState) {
        let Some(trigger) = self.triggers.get_mut(key) else {
            return;
        };
        trace!(trigger = %key, from = %trigger.state, to = %state, "Finalizing trigger");
        trigger.state = state;
        self.queue.remove(key);
        self.paused_triggers.remove(key);
        self.writer.mark_dirty(key);
        if state == TriggerState::Complete {
            self.signaler.notify_trigger_finalized(trigger);
        }
    }

    /// Add a trigger, computing its first fire time
    ///
    /// A rejected trigger leaves any stored trigger of the same key as it was.
    pub fn add(&mut self, mut trigger: Trigger, replace: bool) -> Result<()> {
        trigger.validate()?;
        if self.triggers.contains_key(&trigger.key) {
            if !replace {
                return Err(StoreError::TriggerAlreadyExists(trigger.key));
            }
            self.detach(&trigger.key);
        }

        let key = trigger.key.clone();
        trigger.node = self.node.clone();
        trigger.state = TriggerState::Waiting;
        trigger.state_info = None;
        trigger.fire_instance_id = None;
        let first = trigger.compute_first_fire_time();
        let paused = self.paused_groups.contains(key.group());
        trace!(trigger = %key, first_fire_time = ?first, "Adding trigger");
        self.attach(trigger);

        if first.is_none() {
            warn!(trigger = %key, "Trigger will never fire");
            self.finalize(&key, TriggerState::Complete);
        } else if paused {
            self.set_paused(&key);
        } else {
            self.to_idle(&key);
        }
        Ok(())
    }

    /// Remove a trigger; its document is deleted on the next flush
    pub fn remove(&mut self, key: &TriggerKey) -> Option<Trigger> {
        let trigger = self.detach(key)?;
        trace!(trigger = %key, "Removed trigger");
        self.mark_dirty(key);
        Some(trigger)
    }

    /// Remove every trigger of a job
    pub fn remove_for_job(&mut self, job: &JobKey) -> Vec<Trigger> {
        self.keys_for_job(job)
            .iter()
            .filter_map(|key| self.remove(key))
            .collect()
    }

    /// Bring an `ERROR` trigger back into scheduling
    pub fn reset_from_error(&mut self, key: &TriggerKey) -> bool {
        match self.triggers.get_mut(key) {
            Some(trigger) if trigger.state == TriggerState::Error => {
                trigger.state_info = None;
                if trigger.next_fire_time.is_none() {
                    trigger.compute_first_fire_time();
                }
            }
            _ => return false,
        }
        if self.check_misfire(key, Utc::now()) == Misfire::Completed {
            return true;
        }
        self.to_idle(key);
        true
    }

    /// Pause one trigger; false if it was already paused or complete
    pub fn pause(&mut self, key: &TriggerKey) -> bool {
        match self.triggers.get(key).map(|t| t.state) {
            None
            | Some(TriggerState::Complete)
            | Some(TriggerState::Deleted)
            | Some(TriggerState::Paused)
            | Some(TriggerState::PausedBlocked) => false,
            Some(_) => {
                self.set_paused(key);
                true
            }
        }
    }

    /// Resume one paused trigger; false if it was not paused
    pub fn resume(&mut self, key: &TriggerKey) -> bool {
        match self.triggers.get(key).map(|t| t.state) {
            Some(TriggerState::Paused) | Some(TriggerState::PausedBlocked) => {}
            _ => return false,
        }
        if let Some(trigger) = self.triggers.get_mut(key) {
            trigger.state = TriggerState::Waiting;
        }
        self.paused_triggers.remove(key);
        if self.check_misfire(key, Utc::now()) != Misfire::Completed {
            self.to_idle(key);
        }
        true
    }

    /// Pause every trigger of a job; returns how many changed
    pub fn pause_job(&mut self, job: &JobKey) -> usize {
        self.keys_for_job(job)
            .iter()
            .filter(|key| self.pause(key))
            .count()
    }

    /// Resume every trigger of a job; returns how many changed
    pub fn resume_job(&mut self, job: &JobKey) -> usize {
        self.keys_for_job(job)
            .iter()
            .filter(|key| self.resume(key))
            .count()
    }

    /// Pause triggers in matching groups; an exact group also pauses
    /// triggers added to it later
    pub fn pause_group(&mut self, matcher: &GroupMatcher) -> BTreeSet<String> {
        if let Some(group) = matcher.exact_group() {
            self.paused_groups.insert(group.to_string());
        }
        let keys = self.keys(matcher);
        for key in &keys {
            self.pause(key);
        }
        let mut groups: BTreeSet<String> = keys.iter().map(|k| k.group().to_string()).collect();
        groups.extend(matcher.exact_group().map(str::to_string));
        groups
    }

    /// Resume triggers in matching groups
    pub fn resume_group(&mut self, matcher: &GroupMatcher) -> BTreeSet<String> {
        self.paused_groups.retain(|group| !matcher.matches(group));
        let keys = self.keys(matcher);
        for key in &keys {
            self.resume(key);
        }
        keys.iter().map(|k| k.group().to_string()).collect()
    }

    /// Pause everything, including groups added later
    pub fn pause_all(&mut self) {
        let groups = self.group_names();
        self.pause_group(&GroupMatcher::Anything);
        self.paused_groups.extend(groups);
    }

    /// Resume everything
    pub fn resume_all(&mut self) {
        self.paused_groups.clear();
        self.resume_group(&GroupMatcher::Anything);
    }

    /// Reschedule a trigger whose fire time is too far in the past
    fn check_misfire(&mut self, key: &TriggerKey, now: DateTime<Utc>) -> Misfire {
        let misfire_before = now - self.misfire_threshold;
        let Some(trigger) = self.triggers.get_mut(key) else {
            return Misfire::None;
        };
        let Some(previous) = trigger.next_fire_time else {
            return Misfire::None;
        };
        if previous > misfire_before || trigger.ignores_misfires() {
            return Misfire::None;
        }

        self.signaler.notify_trigger_misfired(trigger);
        trigger.update_after_misfire(now);
        self.writer.mark_dirty(key);
        debug!(
            trigger = %key,
            missed = %previous,
            next = ?trigger.next_fire_time,
            "Trigger misfired"
        );

        let next = trigger.next_fire_time;
        match next {
            None => {
                self.finalize(key, TriggerState::Complete);
                Misfire::Completed
            }
            Some(next) if next != previous => Misfire::Rescheduled,
            Some(_) => Misfire::None,
        }
    }

    /// Take a batch of due triggers off the queue
    ///
    /// The first accepted trigger must be due by `no_later_than`; after it,
    /// the boundary becomes `max(its fire time, now) + time_window`.
    /// Triggers rescheduled by a misfire are only reconsidered by the next
    /// call. A job that disallows concurrent execution gets at most one
    /// trigger per batch.
    pub fn acquire_next(
        &mut self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        disallows_concurrency: impl Fn(&JobKey) -> bool,
    ) -> Vec<Trigger> {
        debug!("Number of active triggers: {}", self.queue.len());
        let mut acquired: Vec<Trigger> = Vec::new();
        if max_count == 0 {
            return acquired;
        }

        let now = Utc::now();
        let mut batch_end = no_later_than;
        let mut deferred: Vec<TriggerKey> = Vec::new();
        let mut exclusive_jobs: HashSet<JobKey> = HashSet::new();

        while let Some(entry) = self.queue.poll_first() {
            let key = entry.key;
            let Some(trigger) = self.triggers.get(&key) else {
                continue;
            };
            if trigger.state != TriggerState::Waiting {
                warn!(trigger = %key, state = %trigger.state, "Dropping stale queue entry");
                continue;
            }
            if entry.next_fire_time.is_none() || trigger.next_fire_time.is_none() {
                trace!(trigger = %key, "Next fire time is absent");
                self.finalize(&key, TriggerState::Complete);
                continue;
            }

            match self.check_misfire(&key, now) {
                Misfire::Rescheduled => {
                    deferred.push(key);
                    continue;
                }
                Misfire::Completed => continue,
                Misfire::None => {}
            }

            let Some(trigger) = self.triggers.get_mut(&key) else {
                continue;
            };
            let Some(fire_time) = trigger.next_fire_time else {
                continue;
            };
            if fire_time > batch_end {
                trace!(trigger = %key, %fire_time, "After batch end; leaving queued");
                self.queue.insert(trigger);
                break;
            }
            if disallows_concurrency(&trigger.job_key)
                && !exclusive_jobs.insert(trigger.job_key.clone())
            {
                deferred.push(key);
                continue;
            }

            trigger.state = TriggerState::Acquired;
            trigger.node = self.node.clone();
            trigger.fire_instance_id = Some(Uuid::new_v4().to_string());
            self.writer.mark_dirty(&key);

            if acquired.is_empty() {
                batch_end = fire_time.max(now) + time_window;
            }
            acquired.push(trigger.clone());
            if acquired.len() >= max_count {
                break;
            }
        }

        for key in deferred {
            if let Some(trigger) = self.triggers.get(&key) {
                if trigger.state == TriggerState::Waiting {
                    self.queue.insert(trigger);
                }
            }
        }

        debug!(
            "Acquired triggers: {:?}",
            acquired.iter().map(|t| t.key.to_string()).collect::<Vec<_>>()
        );
        acquired
    }

    /// Put an acquired trigger back without firing it
    pub fn release(&mut self, key: &TriggerKey) -> bool {
        match self.triggers.get_mut(key) {
            Some(trigger) if trigger.state == TriggerState::Acquired => {
                trace!(trigger = %key, "Releasing acquired trigger");
                trigger.fire_instance_id = None;
            }
            _ => return false,
        }
        self.to_idle(key);
        true
    }

    /// Record the firing of an acquired trigger
    ///
    /// A trigger whose job vanished becomes `DELETED`. A trigger of a
    /// non-concurrent job that is already running goes to `BLOCKED`
    /// instead of firing.
    pub fn fire(&mut self, key: &TriggerKey, job: Option<&JobDetail>) -> Option<TriggerFiredBundle> {
        match self.triggers.get(key) {
            Some(trigger) if trigger.state == TriggerState::Acquired => {}
            _ => return None,
        }
        let Some(job) = job else {
            debug!(
                trigger = %key,
                "Job of fired trigger is gone; it was probably deleted after acquisition"
            );
            self.finalize(key, TriggerState::Deleted);
            return None;
        };
        if job.concurrent_execution_disallowed && self.blocked_jobs.contains(&job.key) {
            debug!(trigger = %key, job = %job.key, "Job is already running; blocking trigger");
            self.to_idle(key);
            return None;
        }

        let now = Utc::now();
        self.queue.remove(key);
        let trigger = self.triggers.get_mut(key)?;
        let previous_fire_time = trigger.previous_fire_time;
        let scheduled_fire_time = trigger.next_fire_time;
        trigger.triggered();
        trigger.state = TriggerState::Executing;
        trigger.node = self.node.clone();
        let bundle = TriggerFiredBundle {
            job: job.clone(),
            trigger: trigger.clone(),
            fire_time: now,
            scheduled_fire_time,
            previous_fire_time,
            next_fire_time: trigger.next_fire_time,
        };
        self.writer.mark_dirty(key);

        if job.concurrent_execution_disallowed {
            self.block_idle(&job.key);
        }
        Some(bundle)
    }

    /// Apply the engine's completion instruction for a fired trigger
    pub fn complete(
        &mut self,
        key: &TriggerKey,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let was_blocked = self.unblock_job(&job.key);
        if job.concurrent_execution_disallowed || was_blocked {
            self.signaler.signal_scheduling_change(None);
        }

        let Some(state) = self.triggers.get(key).map(|t| t.state) else {
            return;
        };
        match instruction {
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.finalize(key, TriggerState::Complete);
                self.signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::DeleteTrigger => {
                trace!(trigger = %key, job = %job.key, "Trigger is being deleted");
                self.finalize(key, TriggerState::Deleted);
                self.signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                for sibling in self.keys_for_job(&job.key) {
                    self.finalize(&sibling, TriggerState::Complete);
                }
                self.signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                trace!(trigger = %key, job = %job.key, "Trigger is set to error state");
                self.finalize(key, TriggerState::Error);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                for sibling in self.keys_for_job(&job.key) {
                    self.finalize(&sibling, TriggerState::Error);
                }
                self.signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::NoInstruction => match state {
                TriggerState::Paused | TriggerState::PausedBlocked => {}
                _ if self.triggers.get(key).is_some_and(|t| t.next_fire_time.is_none()) => {
                    self.finalize(key, TriggerState::Complete);
                }
                _ => {
                    self.to_idle(key);
                }
            },
        }
        trace!(
            trigger = %key,
            ?instruction,
            state = ?self.triggers.get(key).map(|t| t.state),
            "Trigger completed"
        );
    }

    fn block_idle(&mut self, job: &JobKey) {
        self.blocked_jobs.insert(job.clone());
        for key in self.keys_for_job(job) {
            let Some(trigger) = self.triggers.get_mut(&key) else {
                continue;
            };
            match trigger.state {
                TriggerState::Waiting => {
                    trigger.state = TriggerState::Blocked;
                    self.queue.remove(&key);
                }
                TriggerState::Paused => trigger.state = TriggerState::PausedBlocked,
                _ => continue,
            }
            self.writer.mark_dirty(&key);
        }
    }

    /// Release a job from blocking and return its idle triggers to
    /// scheduling; true if the job was blocked
    pub fn unblock_job(&mut self, job: &JobKey) -> bool {
        let was_blocked = self.blocked_jobs.remove(job);
        for key in self.keys_for_job(job) {
            let Some(trigger) = self.triggers.get_mut(&key) else {
                continue;
            };
            match trigger.state {
                TriggerState::Blocked => {
                    trigger.state = TriggerState::Waiting;
                    self.queue.insert(trigger);
                }
                TriggerState::PausedBlocked => trigger.state = TriggerState::Paused,
                _ => continue,
            }
            self.writer.mark_dirty(&key);
        }
        was_blocked
    }

    /// Admit triggers read at load time and settle their inherited state
    ///
    /// Returns triggers recorded as executing on another node; their jobs
    /// stay blocked until recovery confirms them.
    pub fn load(
        &mut self,
        loaded: Vec<(Trigger, LoadedState)>,
        disallows_concurrency: impl Fn(&JobKey) -> bool,
    ) -> Vec<TriggerKey> {
        let mut settle: Vec<TriggerKey> = Vec::new();
        let mut pending: Vec<TriggerKey> = Vec::new();

        for (mut trigger, state) in loaded {
            match state {
                LoadedState::Failed(reason) => {
                    error!(trigger = %trigger.key, "Failed to load trigger: {}", reason);
                    continue;
                }
                LoadedState::Missing => {
                    trigger.node = self.node.clone();
                    trigger.state = TriggerState::Waiting;
                    trigger.compute_first_fire_time();
                }
                LoadedState::Found(source) => {
                    trigger.apply_document(&source);
                    if trigger.state == TriggerState::Deleted {
                        trigger.node = self.node.clone();
                        trigger.state = TriggerState::Waiting;
                        trigger.next_fire_time = None;
                    }
                }
            }
            trace!(trigger = %trigger.key, state = %trigger.state, node = %trigger.node, "Loaded trigger");

            match trigger.state {
                TriggerState::Executing if trigger.node != self.node => {
                    debug!(trigger = %trigger.key, node = %trigger.node, "Trigger is marked as still executing on another node");
                    if disallows_concurrency(&trigger.job_key) {
                        self.blocked_jobs.insert(trigger.job_key.clone());
                    }
                    pending.push(trigger.key.clone());
                }
                TriggerState::Waiting
                | TriggerState::Acquired
                | TriggerState::Blocked
                | TriggerState::Executing
                | TriggerState::PausedBlocked => {
                    if trigger.next_fire_time.is_none() {
                        trigger.compute_first_fire_time();
                    }
                    trigger.node = self.node.clone();
                    trigger.fire_instance_id = None;
                    settle.push(trigger.key.clone());
                }
                TriggerState::Paused => {
                    self.paused_triggers.insert(trigger.key.clone());
                }
                TriggerState::Complete | TriggerState::Error | TriggerState::Deleted => {}
            }
            self.attach(trigger);
        }

        for key in settle {
            let paused = self
                .triggers
                .get(&key)
                .is_some_and(|t| t.state == TriggerState::PausedBlocked);
            if paused {
                self.set_paused(&key);
            } else if self.triggers.get(&key).is_some_and(|t| t.next_fire_time.is_none()) {
                self.finalize(&key, TriggerState::Complete);
            } else {
                self.to_idle(&key);
            }
        }
        let blocked: Vec<JobKey> = self.blocked_jobs.iter().cloned().collect();
        for job in blocked {
            self.block_idle(&job);
        }
        self.mark_all_dirty();
        pending
    }

    /// Keys of the given set that are still executing
    pub fn still_executing(&self, keys: &HashSet<TriggerKey>) -> HashSet<TriggerKey> {
        keys.iter()
            .filter(|key| {
                self.triggers
                    .get(*key)
                    .is_some_and(|t| t.state == TriggerState::Executing)
            })
            .cloned()
            .collect()
    }

    /// Take over a trigger whose executing node did not confirm it
    ///
    /// `persisted` is the freshly read document; if it no longer says
    /// `EXECUTING` the trigger adopts it, otherwise it becomes idle under
    /// local ownership. Returns whether the trigger was queued.
    pub fn recover(
        &mut self,
        key: &TriggerKey,
        persisted: Option<&Value>,
        disallows_concurrency: bool,
    ) -> bool {
        let Some(trigger) = self.triggers.get_mut(key) else {
            return false;
        };
        if trigger.state != TriggerState::Executing {
            return false;
        }
        let job = trigger.job_key.clone();

        let still_executing = persisted
            .and_then(|doc| doc.get("state"))
            .and_then(Value::as_str)
            .is_none_or(|state| state == "EXECUTING");
        if still_executing {
            if trigger.next_fire_time.is_none() {
                trigger.compute_first_fire_time();
            }
        } else if let Some(doc) = persisted {
            trigger.apply_document(doc);
        }
        trigger.node = self.node.clone();
        trigger.fire_instance_id = None;
        let state = trigger.state;

        if disallows_concurrency && !self.sibling_executing(&job, key) {
            self.unblock_job(&job);
            self.signaler.signal_scheduling_change(None);
        }

        let queued = match state {
            TriggerState::Executing | TriggerState::Waiting | TriggerState::Blocked | TriggerState::Acquired => {
                self.to_idle(key)
            }
            TriggerState::Paused | TriggerState::PausedBlocked => {
                self.set_paused(key);
                false
            }
            _ => {
                self.queue.remove(key);
                self.paused_triggers.remove(key);
                false
            }
        };
        self.mark_dirty(key);
        queued
    }

    fn sibling_executing(&self, job: &JobKey, except: &TriggerKey) -> bool {
        self.for_job(job)
            .iter()
            .any(|t| &t.key != except && t.state == TriggerState::Executing)
    }

    /// Hand dirty trigger state to the writer
    ///
    /// `DELETED` triggers are dropped here. Returns jobs left without
    /// triggers by that.
    pub fn flush(&mut self) -> Vec<JobKey> {
        let keys = self.writer.drain_dirty();
        if keys.is_empty() {
            return Vec::new();
        }
        let mut batch = Vec::with_capacity(keys.len());
        let mut emptied = Vec::new();

        for key in keys {
            let Some(trigger) = self.triggers.get(&key) else {
                batch.push(TriggerWrite::Delete(key));
                continue;
            };
            if trigger.state == TriggerState::Deleted {
                if let Some(removed) = self.detach(&key) {
                    if !self.has_triggers(&removed.job_key) {
                        emptied.push(removed.job_key);
                    }
                }
                batch.push(TriggerWrite::Delete(key));
                continue;
            }
            match serde_json::to_value(trigger.document()) {
                Ok(source) => batch.push(TriggerWrite::Index(key, source)),
                Err(e) => {
                    error!(trigger = %key, "Could not serialize trigger state: {}", e);
                    self.writer.mark_dirty(&key);
                }
            }
        }
        self.writer.submit(batch);
        emptied
    }

    /// Drop all in-memory state; persisted documents are left alone
    pub fn clear(&mut self) {
        self.triggers.clear();
        self.by_job.clear();
        self.queue.clear();
        self.blocked_jobs.clear();
        self.paused_triggers.clear();
        self.paused_groups.clear();
    }
}
