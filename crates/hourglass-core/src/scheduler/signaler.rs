//! Notifications from the store to the scheduling engine

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::trace;

use super::trigger::Trigger;

/// Receives scheduling events raised by the store
pub trait SchedulerSignaler: Send + Sync {
    /// Scheduling data changed; idle engine threads should re-evaluate
    fn signal_scheduling_change(&self, candidate_next_fire_time: Option<DateTime<Utc>>);

    /// A trigger missed its fire time
    fn notify_trigger_misfired(&self, trigger: &Trigger);

    /// A trigger will never fire again
    fn notify_trigger_finalized(&self, trigger: &Trigger);
}

/// Signaler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
    fn signal_scheduling_change(&self, _candidate_next_fire_time: Option<DateTime<Utc>>) {}

    fn notify_trigger_misfired(&self, _trigger: &Trigger) {}

    fn notify_trigger_finalized(&self, _trigger: &Trigger) {}
}

/// Signaler that wakes a waiting firing loop and counts events
#[derive(Debug, Default)]
pub struct NotifySignaler {
    notify: Notify,
    changes: AtomicUsize,
    misfires: AtomicUsize,
    finalized: AtomicUsize,
}

impl NotifySignaler {
    /// Create a signaler
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the next scheduling change
    pub async fn changed(&self) {
        self.notify.notified().await;
    }

    /// Scheduling changes signalled so far
    pub fn change_count(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }

    /// Misfires reported so far
    pub fn misfire_count(&self) -> usize {
        self.misfires.load(Ordering::SeqCst)
    }

    /// Finalized triggers reported so far
    pub fn finalized_count(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl SchedulerSignaler for NotifySignaler {
    fn signal_scheduling_change(&self, candidate_next_fire_time: Option<DateTime<Utc>>) {
        trace!(?candidate_next_fire_time, "Scheduling change");
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn notify_trigger_misfired(&self, trigger: &Trigger) {
        trace!(trigger = %trigger.key, "Trigger misfired");
        self.misfires.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_trigger_finalized(&self, trigger: &Trigger) {
        trace!(trigger = %trigger.key, "Trigger finalized");
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }
}
