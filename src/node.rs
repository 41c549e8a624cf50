//! Scheduler node wiring
//!
//! Connects the store to a SQLite document store, the configured jobs and
//! the firing loop, then runs until Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use chrono::DateTime;
use hourglass_core::documents::DocumentStore;
use hourglass_core::scheduler::{JobSource, NotifySignaler, TriggerKey};
use hourglass_core::shutdown::{wait_for_shutdown_signal, ShutdownController};
use hourglass_core::{SchedulerStore, SqliteDocumentStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::FiringEngine;
use crate::jobs::ConfigJobSource;
use crate::settings::AppConfig;

async fn open_store(config: &AppConfig, signaler: Arc<NotifySignaler>) -> Result<Arc<SchedulerStore>> {
    let documents = SqliteDocumentStore::from_path(&config.documents.path)
        .await
        .with_context(|| format!("Failed to open {}", config.documents.path.display()))?;

    let store = SchedulerStore::builder(config.store.clone())
        .documents(Arc::new(documents))
        .job_source(Arc::new(ConfigJobSource::new(config.jobs.clone())))
        .signaler(signaler)
        .build()
        .context("Failed to build scheduler store")?;
    store
        .initialize()
        .await
        .context("Failed to initialize scheduler store")?;
    Ok(store)
}

/// Run a node until a shutdown signal arrives
pub async fn run(config: AppConfig) -> Result<()> {
    info!(
        scheduler = %config.store.scheduler_name,
        node = %config.store.node_id,
        "Starting Hourglass v{}",
        env!("CARGO_PKG_VERSION")
    );

    let signaler = Arc::new(NotifySignaler::new());
    let store = open_store(&config, signaler.clone()).await?;
    info!(
        jobs = store.job_count().await,
        triggers = store.trigger_count().await,
        "Scheduling data loaded"
    );

    let shutdown = ShutdownController::with_timeout(store.config().shutdown_timeout());
    let engine = Arc::new(FiringEngine::new(
        store.clone(),
        signaler,
        shutdown.clone(),
        config.engine.clone(),
    ));

    let token = shutdown.token();
    let runner = engine.clone();
    let firing = tokio::spawn(async move { runner.run(token).await });

    wait_for_shutdown_signal().await;

    if !shutdown.shutdown().await {
        warn!(
            active = shutdown.active_executions(),
            "Jobs still running; stopping anyway"
        );
    }
    if let Err(e) = firing.await {
        warn!("Firing loop ended abnormally: {}", e);
    }
    if !store.shutdown().await {
        warn!("Not every trigger state was written before shutdown");
    }

    info!("Hourglass stopped");
    Ok(())
}

/// Print the persisted state of every configured trigger
///
/// Reads documents only; nothing is loaded into a store or written back.
pub async fn print_triggers(config: AppConfig) -> Result<()> {
    let documents = SqliteDocumentStore::from_path(&config.documents.path)
        .await
        .with_context(|| format!("Failed to open {}", config.documents.path.display()))?;

    let jobs = ConfigJobSource::new(config.jobs.clone()).load_jobs().await?;
    let keys: BTreeSet<TriggerKey> = jobs
        .into_iter()
        .flat_map(|job| job.triggers.into_iter().map(|t| t.key))
        .collect();

    println!("{:<40} {:<16} {:<12} NEXT FIRE", "TRIGGER", "STATE", "NODE");
    for key in keys {
        let id = key.document_id(config.store.doc_id_prefix.as_deref());
        match documents.get(&id).await? {
            Some(doc) => println!(
                "{:<40} {:<16} {:<12} {}",
                key.to_string(),
                doc["state"].as_str().unwrap_or("?"),
                doc["node"].as_str().unwrap_or("?"),
                doc["next_fire_time"]
                    .as_i64()
                    .and_then(DateTime::from_timestamp_millis)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            ),
            None => println!("{:<40} NOT PERSISTED", key.to_string()),
        }
    }
    Ok(())
}
