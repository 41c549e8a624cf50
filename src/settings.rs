//! Node configuration
//!
//! Sources, lowest precedence first:
//! 1. Embedded `config/default.toml`
//! 2. `config/local.toml` (optional)
//! 3. The file passed with `--config` (optional)
//! 4. `HOURGLASS_*` environment variables, `__` between nesting levels

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use hourglass_core::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::EngineConfig;
use crate::jobs::JobSettings;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

/// Trigger document storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// SQLite database file
    pub path: PathBuf,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hourglass.db"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Load configuration from files and environment
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        .add_source(File::with_name("config/local").required(false));
    if let Some(path) = path {
        builder = builder.add_source(File::from(path.to_path_buf()).required(true));
    }
    let config = builder
        // HOURGLASS_STORE__NODE_ID sets store.node_id
        .add_source(
            Environment::with_prefix("HOURGLASS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let app: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;
    app.store.validate().context("Invalid store configuration")?;
    app.engine.validate().context("Invalid engine configuration")?;
    Ok(app)
}
