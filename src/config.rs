//! Server configuration: an optional TOML file overlaid by `MERON_*`
//! environment variables, e.g. `MERON_PORT=9000` or
//! `MERON_ANALYZER__COMMAND=/opt/meron/analyze`.

use crate::analyzer::{Analyzer, CommandAnalyzer, PlaceholderAnalyzer};
use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

/// Read from the working directory when no file is given
pub const DEFAULT_CONFIG_FILE: &str = "meron";

/// Default tracing filter when `RUST_LOG` is not set
pub const DEFAULT_LOG: &str = "meron_api=info,actix_web=info";

/// Largest accepted request body
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    /// Tracing filter directive, overridden by `RUST_LOG`
    pub log: String,

    pub max_body_bytes: usize,

    #[serde(default)]
    pub analyzer: AnalyzerSettings,
}

/// Which analyzer to run. Without a command the placeholder is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzerSettings {
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Settings {
    /// Load the settings from `path` (must exist) or from the optional
    /// default file, then apply the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 8000)?
            .set_default("log", DEFAULT_LOG)?
            .set_default("max_body_bytes", DEFAULT_MAX_BODY_BYTES as i64)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("MERON")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Build the configured analyzer
    pub fn analyzer(&self) -> Arc<dyn Analyzer> {
        match &self.analyzer.command {
            Some(command) => Arc::new(CommandAnalyzer::new(command, self.analyzer.args.clone())),
            None => {
                warn!("no analyzer command configured, using the placeholder analyzer");
                Arc::new(PlaceholderAnalyzer)
            }
        }
    }
}
