//! Firing loop of a scheduler node
//!
//! Drives a [`SchedulerStore`]:
//! - Acquire a batch of due triggers
//! - Sleep until the earliest fire time, giving the batch back on any
//!   scheduling change
//! - Record the firing and run each job concurrently
//! - Report completion so the trigger moves on

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use hourglass_core::scheduler::{JobAction, JobDetail, NotifySignaler, TriggerFiredBundle};
use hourglass_core::shutdown::ShutdownController;
use hourglass_core::SchedulerStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback type for executing job actions
pub type JobExecutor = Arc<dyn Fn(JobDetail) -> JobExecutionFuture + Send + Sync>;

/// Future type for job execution
pub type JobExecutionFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send>>;

/// Longest accepted batch window or idle wait, in milliseconds
pub const MAX_ENGINE_WAIT_MS: u64 = 24 * 60 * 60 * 1000;

/// Firing loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum triggers acquired per batch
    pub batch_size: usize,
    /// How far past the first trigger a batch may reach, in milliseconds
    pub batch_window_ms: u64,
    /// How far ahead to look, and how long to sleep when nothing is due, in milliseconds
    pub idle_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_window_ms: 0,
            idle_wait_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Set idle wait
    pub fn with_idle_wait(mut self, wait: std::time::Duration) -> Self {
        self.idle_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check the configured limits
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be at least 1");
        anyhow::ensure!(
            self.batch_window_ms <= MAX_ENGINE_WAIT_MS,
            "batch_window_ms must not exceed {} ms",
            MAX_ENGINE_WAIT_MS
        );
        anyhow::ensure!(
            self.idle_wait_ms <= MAX_ENGINE_WAIT_MS,
            "idle_wait_ms must not exceed {} ms",
            MAX_ENGINE_WAIT_MS
        );
        Ok(())
    }

    fn batch_window(&self) -> Duration {
        bounded_millis(self.batch_window_ms)
    }

    fn idle_horizon(&self) -> Duration {
        bounded_millis(self.idle_wait_ms)
    }

    fn idle_wait(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_wait_ms.min(MAX_ENGINE_WAIT_MS))
    }
}

fn bounded_millis(ms: u64) -> Duration {
    let ms = i64::try_from(ms.min(MAX_ENGINE_WAIT_MS)).unwrap_or(i64::MAX);
    Duration::milliseconds(ms)
}

/// Fires the triggers of one store
pub struct FiringEngine {
    store: Arc<SchedulerStore>,
    signaler: Arc<NotifySignaler>,
    shutdown: Arc<ShutdownController>,
    config: EngineConfig,
    executor: JobExecutor,
}

impl FiringEngine {
    /// Create an engine running jobs with [`run_action`]
    pub fn new(
        store: Arc<SchedulerStore>,
        signaler: Arc<NotifySignaler>,
        shutdown: Arc<ShutdownController>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            signaler,
            shutdown,
            config,
            executor: Arc::new(|job: JobDetail| -> JobExecutionFuture {
                Box::pin(async move { run_action(&job.action).await })
            }),
        }
    }

    /// Replace the job executor
    pub fn with_executor(mut self, executor: JobExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Run until the token is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            idle_wait_ms = self.config.idle_wait_ms,
            "Firing loop starting"
        );
        self.store.scheduler_started();

        while !token.is_cancelled() {
            let no_later_than = Utc::now() + self.config.idle_horizon();
            let batch = self
                .store
                .acquire_next_triggers(no_later_than, self.config.batch_size, self.config.batch_window())
                .await;

            if batch.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = self.signaler.changed() => {}
                    _ = tokio::time::sleep(self.config.idle_wait()) => {}
                }
                continue;
            }

            let earliest = batch.iter().filter_map(|t| t.next_fire_time).min();
            let wait = earliest
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or_default();
            debug!(triggers = batch.len(), wait_ms = wait.as_millis() as u64, "Acquired batch");

            let interrupted = tokio::select! {
                _ = token.cancelled() => true,
                _ = self.signaler.changed() => true,
                _ = tokio::time::sleep(wait) => false,
            };
            if interrupted {
                debug!(triggers = batch.len(), "Scheduling changed; releasing batch");
                for trigger in &batch {
                    self.store.release_acquired_trigger(&trigger.key).await;
                }
                continue;
            }

            let keys: Vec<_> = batch.into_iter().map(|t| t.key).collect();
            let fired = self.store.triggers_fired(&keys).await;
            if fired.len() < keys.len() {
                debug!(acquired = keys.len(), fired = fired.len(), "Some triggers were not fired");
            }
            for bundle in fired {
                self.execute(bundle);
            }
        }

        info!("Firing loop stopped");
    }

    fn execute(&self, bundle: TriggerFiredBundle) {
        let store = self.store.clone();
        let executor = self.executor.clone();
        let guard = self.shutdown.register_execution();

        tokio::spawn(async move {
            let key = bundle.trigger.key.clone();
            let mut job = bundle.job;
            info!(trigger = %key, job = %job.key, "Executing job");

            match executor(job.clone()).await {
                Ok(output) => {
                    info!(trigger = %key, job = %job.key, "Job completed");
                    if job.persist_data_after_execution {
                        job.data.insert("last_output".to_string(), json!(output));
                        job.data
                            .insert("last_fire_time".to_string(), json!(bundle.fire_time.to_rfc3339()));
                    }
                }
                Err(e) => error!(trigger = %key, job = %job.key, "Job failed: {:#}", e),
            }

            let instruction = bundle.trigger.execution_complete_instruction();
            store.triggered_job_complete(&key, &job, instruction).await;
            if guard.is_cancelled() {
                debug!(trigger = %key, "Job finished during shutdown");
            }
        });
    }
}

/// Run a job action
pub async fn run_action(action: &JobAction) -> anyhow::Result<String> {
    match action {
        JobAction::Log { message } => {
            info!(target: "hourglass::job", "{}", message);
            Ok(message.clone())
        }
        JobAction::Shell { command, cwd } => {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            if let Some(cwd) = cwd {
                cmd.current_dir(cwd);
            }
            let output = cmd
                .output()
                .await
                .with_context(|| format!("Failed to spawn '{}'", command))?;
            if !output.status.success() {
                bail!(
                    "'{}' exited with {}: {}",
                    command,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        JobAction::Named { name } => {
            warn!(name = %name, "No executor registered for named job");
            bail!("no executor for '{}'", name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hourglass_core::scheduler::{
        JobConfig, JobKey, Schedule, StaticJobSource, StoreConfig, Trigger, TriggerKey,
        TriggerState,
    };
    use hourglass_core::MemoryDocumentStore;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    struct TestContext {
        store: Arc<SchedulerStore>,
        engine: Arc<FiringEngine>,
        shutdown: Arc<ShutdownController>,
        runs: Arc<Mutex<Vec<String>>>,
    }

    async fn create_test_context(jobs: Vec<JobConfig>) -> TestContext {
        let signaler = Arc::new(NotifySignaler::new());
        let store = SchedulerStore::builder(StoreConfig::new("engine-test", "node-1"))
            .documents(Arc::new(MemoryDocumentStore::new()))
            .signaler(signaler.clone())
            .job_source(Arc::new(StaticJobSource::new(jobs)))
            .build()
            .unwrap();
        store.initialize().await.unwrap();

        let runs = Arc::new(Mutex::new(Vec::new()));
        let recorded = runs.clone();
        let executor: JobExecutor = Arc::new(move |job: JobDetail| -> JobExecutionFuture {
            let recorded = recorded.clone();
            Box::pin(async move {
                recorded.lock().unwrap().push(job.key.to_string());
                Ok("done".to_string())
            })
        });

        let shutdown = ShutdownController::new();
        let engine = FiringEngine::new(
            store.clone(),
            signaler,
            shutdown.clone(),
            EngineConfig::default().with_idle_wait(StdDuration::from_millis(200)),
        )
        .with_executor(executor);

        TestContext {
            store,
            engine: Arc::new(engine),
            shutdown,
            runs,
        }
    }

    fn once_now(name: &str) -> JobConfig {
        let job = JobDetail::new(
            JobKey::new("g", name),
            JobAction::Log {
                message: name.to_string(),
            },
        )
        .durable(true)
        .persist_data_after_execution(true);
        let trigger = Trigger::new(
            TriggerKey::new("g", name),
            job.key.clone(),
            Schedule::once(Utc::now()),
        );
        JobConfig::new(job, vec![trigger])
    }

    async fn wait_for_runs(ctx: &TestContext, count: usize) {
        for _ in 0..100 {
            if ctx.runs.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("expected {} runs, saw {:?}", count, ctx.runs.lock().unwrap());
    }

    #[tokio::test]
    async fn test_due_trigger_fires_and_completes() {
        let ctx = create_test_context(vec![once_now("report")]).await;
        let token = ctx.shutdown.token();
        let engine = ctx.engine.clone();
        let handle = tokio::spawn(async move { engine.run(token).await });

        wait_for_runs(&ctx, 1).await;
        assert!(ctx.shutdown.shutdown().await);
        handle.await.unwrap();

        assert_eq!(*ctx.runs.lock().unwrap(), vec!["g.report".to_string()]);
        let trigger = ctx.store.retrieve_trigger(&TriggerKey::new("g", "report")).await.unwrap();
        assert_eq!(trigger.state, TriggerState::Complete);
        let job = ctx.store.retrieve_job(&JobKey::new("g", "report")).await.unwrap();
        assert_eq!(job.data["last_output"], "done");
        assert!(ctx.store.is_started());
    }

    #[tokio::test]
    async fn test_trigger_added_while_idle_fires() {
        let ctx = create_test_context(Vec::new()).await;
        let token = ctx.shutdown.token();
        let engine = ctx.engine.clone();
        let handle = tokio::spawn(async move { engine.run(token).await });

        let JobConfig { job, triggers } = once_now("late");
        ctx.store
            .store_job_and_trigger(job, triggers.into_iter().next().unwrap())
            .await
            .unwrap();

        wait_for_runs(&ctx, 1).await;
        ctx.shutdown.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_loop_releases_batch() {
        let job = JobDetail::new(
            JobKey::new("g", "later"),
            JobAction::Log {
                message: "later".to_string(),
            },
        );
        let trigger = Trigger::new(
            TriggerKey::new("g", "later"),
            job.key.clone(),
            Schedule::once(Utc::now() + Duration::milliseconds(150)),
        );
        let ctx = create_test_context(vec![JobConfig::new(job, vec![trigger])]).await;
        let token = ctx.shutdown.token();
        let engine = ctx.engine.clone();
        let handle = tokio::spawn(async move { engine.run(token).await });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        ctx.shutdown.shutdown().await;
        handle.await.unwrap();

        assert!(ctx.runs.lock().unwrap().is_empty());
        let trigger = ctx.store.retrieve_trigger(&TriggerKey::new("g", "later")).await.unwrap();
        assert_eq!(trigger.state, TriggerState::Waiting);
    }

    #[tokio::test]
    async fn test_shell_action_reports_failure() {
        let ok = run_action(&JobAction::Shell {
            command: "echo hourglass".to_string(),
            cwd: None,
        })
        .await
        .unwrap();
        assert_eq!(ok, "hourglass");

        let err = run_action(&JobAction::Shell {
            command: "exit 3".to_string(),
            cwd: None,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("exit 3"));

        assert!(run_action(&JobAction::Named { name: "x".into() }).await.is_err());
    }
}
