//! Hourglass - Clustered Job Scheduler
//!
//! CLI entry point for a scheduler node.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod cli;
mod engine;
mod jobs;
mod node;
mod settings;

use settings::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = settings::load_config(cli.config.as_deref())?;

    let json = cli.json || config.logging.format == LogFormat::Json;
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hourglass=info,hourglass_core=info".into()),
        )
        .with(fmt_layer)
        .init();

    cli::run(cli, config).await
}
