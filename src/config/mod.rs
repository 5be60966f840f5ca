//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required values are missing or out
//! of range.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::QueueSettings;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// SQLite database file holding the queue and activity tables.
    pub database_path: PathBuf,

    #[serde(default = "default_max_execution_count")]
    pub max_execution_count: u32,

    /// Period of the worn-out sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub otel_endpoint: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_execution_count() -> u32 {
    QueueSettings::default().max_execution_count
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_path: PathBuf::from(required_var("CEQ_DATABASE_PATH")?),
            max_execution_count: parsed_var("CEQ_MAX_EXECUTION_COUNT")?
                .unwrap_or_else(default_max_execution_count),
            sweep_interval_secs: parsed_var("CEQ_SWEEP_INTERVAL_SECS")?
                .unwrap_or_else(default_sweep_interval_secs),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file with the same keys, lower-cased
    /// and without the `CEQ_` prefix.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_execution_count == 0 {
            return Err(Error::Config(
                "max_execution_count must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_execution_count: self.max_execution_count,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
