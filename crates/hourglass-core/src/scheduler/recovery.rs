//! Recovery of triggers inherited in the `EXECUTING` state
//!
//! Triggers recorded as executing on another node are tracked here until a
//! recovery pass confirms or takes them over. Passes run on a timer that
//! re-arms only while triggers remain pending.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys::TriggerKey;

/// Pending set plus the timer driving recovery passes
pub struct RecoveryCoordinator {
    interval: Duration,
    pending: Mutex<HashSet<TriggerKey>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryCoordinator {
    /// Create a coordinator running passes every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Mutex::new(HashSet::new()),
            task: Mutex::new(None),
        }
    }

    /// Delay between passes
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start tracking triggers believed to execute elsewhere
    pub fn track(&self, keys: impl IntoIterator<Item = TriggerKey>) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.extend(keys);
        }
    }

    /// Stop tracking triggers that were confirmed or taken over
    pub fn resolve<'a>(&self, keys: impl IntoIterator<Item = &'a TriggerKey>) {
        if let Ok(mut pending) = self.pending.lock() {
            for key in keys {
                pending.remove(key);
            }
        }
    }

    /// Triggers still awaiting confirmation
    pub fn pending(&self) -> HashSet<TriggerKey> {
        self.pending
            .lock()
            .map(|pending| pending.clone())
            .unwrap_or_default()
    }

    /// Number of triggers awaiting confirmation
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Whether a pass timer is armed
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .ok()
            .and_then(|task| task.as_ref().map(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Arm the pass timer, replacing any previous one
    ///
    /// `pass` returns whether triggers remain pending; the timer stops once
    /// it returns false.
    pub fn start<F, Fut>(&self, pass: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.pending_count() == 0 {
            debug!("No triggers to recover");
            return;
        }
        let interval = self.interval;
        info!(
            pending = self.pending_count(),
            "Scheduling recovery of executing triggers in {:?}", interval
        );
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !pass().await {
                    debug!("Recovery finished");
                    break;
                }
                debug!("Triggers still pending; recovery re-armed");
            }
        });
        match self.task.lock() {
            Ok(mut task) => {
                if let Some(previous) = task.replace(handle) {
                    previous.abort();
                }
            }
            Err(e) => {
                warn!("Recovery task lock poisoned: {}", e);
                handle.abort();
            }
        }
    }

    /// Cancel the timer and forget pending triggers
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().ok().and_then(|mut task| task.take()) {
            handle.abort();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for RecoveryCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}
