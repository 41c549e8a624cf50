//! Command line interface
//!
//! - `run`: start a scheduler node
//! - `triggers`: print the persisted state of every configured trigger

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Hourglass clustered scheduler node
#[derive(Parser, Debug)]
#[command(name = "hourglass")]
#[command(about = "Clustered job and trigger scheduler")]
#[command(version)]
pub struct Cli {
    /// Configuration file layered over the defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node (default)
    Run,
    /// Print persisted trigger state
    Triggers,
}

/// Run the CLI command
pub async fn run(cli: Cli, config: crate::settings::AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Triggers) => crate::node::print_triggers(config).await,
        Some(Commands::Run) | None => crate::node::run(config).await,
    }
}
