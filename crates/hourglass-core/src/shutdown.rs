//! Coordinated shutdown of a scheduler node
//!
//! ```ignore
//! let shutdown = ShutdownController::new();
//!
//! // Firing loop stops when the token is cancelled
//! engine.run(shutdown.token()).await;
//!
//! // Each running job holds a guard
//! let guard = shutdown.register_execution();
//!
//! // Cancel, then wait (bounded) for running jobs
//! shutdown.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on waiting for running jobs, in seconds
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Shutdown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Firing normally
    Running,
    /// No new firings; waiting for running jobs
    Draining,
    /// Shutdown complete
    Terminated,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Cancels the firing loop and waits for running jobs
pub struct ShutdownController {
    cancel_token: CancellationToken,
    phase: AtomicU32,
    shutdown_initiated: AtomicBool,
    active_executions: AtomicU32,
    timeout: Duration,
}

impl ShutdownController {
    /// Create a controller with the default timeout
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS))
    }

    /// Create a controller with a custom timeout
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            cancel_token: CancellationToken::new(),
            phase: AtomicU32::new(ShutdownPhase::Running as u32),
            shutdown_initiated: AtomicBool::new(false),
            active_executions: AtomicU32::new(0),
            timeout,
        })
    }

    /// Token cancelled when shutdown starts
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::SeqCst) {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            _ => ShutdownPhase::Terminated,
        }
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Track one running job until the guard drops
    pub fn register_execution(self: &Arc<Self>) -> ExecutionGuard {
        self.active_executions.fetch_add(1, Ordering::SeqCst);
        ExecutionGuard {
            controller: Arc::clone(self),
        }
    }

    /// Number of running jobs
    #[must_use]
    pub fn active_executions(&self) -> u32 {
        self.active_executions.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.store(phase as u32, Ordering::SeqCst);
        info!(phase = %phase, "Shutdown phase changed");
    }

    /// Cancel the firing loop and wait for running jobs
    ///
    /// Returns false if jobs were still running when the timeout expired.
    pub async fn shutdown(&self) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already initiated");
            return true;
        }

        self.set_phase(ShutdownPhase::Draining);
        self.cancel_token.cancel();

        let started = tokio::time::Instant::now();
        let check_interval = Duration::from_millis(100);
        let drained = loop {
            let active = self.active_executions();
            if active == 0 {
                break true;
            }
            if started.elapsed() >= self.timeout {
                warn!(
                    active_executions = active,
                    timeout_secs = self.timeout.as_secs(),
                    "Jobs still running at shutdown timeout"
                );
                break false;
            }
            debug!(active_executions = active, "Waiting for running jobs...");
            tokio::time::sleep(check_interval).await;
        };

        self.set_phase(ShutdownPhase::Terminated);
        drained
    }
}

/// Marks one running job
///
/// Decrements the running count when dropped.
pub struct ExecutionGuard {
    controller: Arc<ShutdownController>,
}

impl ExecutionGuard {
    /// Whether shutdown was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.controller.cancel_token.is_cancelled()
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.controller.active_executions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests;
