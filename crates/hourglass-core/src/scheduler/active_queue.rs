//! Time-ordered queue of triggers eligible to fire
//!
//! Entries are immutable snapshots taken when a trigger is inserted; the
//! live [`Trigger`] stays the source of truth for everything else. The
//! queue enforces no state invariant of its own: callers insert and remove
//! entries as triggers enter and leave `WAITING`.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use super::keys::TriggerKey;
use super::trigger::Trigger;

/// Ordering snapshot of a queued trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTriggerEntry {
    /// Fire time at insertion
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Priority at insertion
    pub priority: i32,
    /// Trigger identity
    pub key: TriggerKey,
}

impl ActiveTriggerEntry {
    /// Snapshot a trigger
    pub fn of(trigger: &Trigger) -> Self {
        Self {
            next_fire_time: trigger.next_fire_time,
            priority: trigger.priority,
            key: trigger.key.clone(),
        }
    }

    fn sort_key(&self) -> (Option<DateTime<Utc>>, Reverse<i32>, &TriggerKey) {
        // None sorts first so acquisition drops such entries early.
        (self.next_fire_time, Reverse(self.priority), &self.key)
    }
}

impl Ord for ActiveTriggerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ActiveTriggerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered set of waiting triggers, by (fire time, priority desc, key)
#[derive(Debug, Default)]
pub struct ActiveTriggerQueue {
    ordered: BTreeSet<ActiveTriggerEntry>,
    by_key: HashMap<TriggerKey, ActiveTriggerEntry>,
}

impl ActiveTriggerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a trigger, replacing any earlier entry for the same key
    pub fn insert(&mut self, trigger: &Trigger) {
        let entry = ActiveTriggerEntry::of(trigger);
        if let Some(previous) = self.by_key.insert(entry.key.clone(), entry.clone()) {
            self.ordered.remove(&previous);
        }
        self.ordered.insert(entry);
    }

    /// Remove a trigger's entry
    pub fn remove(&mut self, key: &TriggerKey) -> Option<ActiveTriggerEntry> {
        let entry = self.by_key.remove(key)?;
        self.ordered.remove(&entry);
        Some(entry)
    }

    /// Remove and return the earliest entry
    pub fn poll_first(&mut self) -> Option<ActiveTriggerEntry> {
        let entry = self.ordered.pop_first()?;
        self.by_key.remove(&entry.key);
        Some(entry)
    }

    /// Earliest entry without removing it
    pub fn peek_first(&self) -> Option<&ActiveTriggerEntry> {
        self.ordered.first()
    }

    /// Whether a trigger is queued
    pub fn contains(&self, key: &TriggerKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Number of queued triggers
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_key.clear();
    }

    /// Queued keys in firing order
    pub fn keys(&self) -> impl Iterator<Item = &TriggerKey> {
        self.ordered.iter().map(|entry| &entry.key)
    }
}
