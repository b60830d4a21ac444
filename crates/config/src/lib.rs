use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use coop_ledger::LedgerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidEnvVar(String, String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read file: {0}")]
    FileReadError(String),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Invalid ledger configuration: {0}")]
    Ledger(#[from] coop_ledger::LedgerError),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable naming the YAML configuration file
pub const CONFIG_FILE_VAR: &str = "COOP_CONFIG_FILE";

/// Node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/coop/ledger.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration from `COOP_CONFIG_FILE` if set, otherwise from
    /// defaults; `COOP_*` variables override either.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match var(CONFIG_FILE_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(path) = var("COOP_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(level) = var("COOP_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(days) = var("COOP_GRACE_PERIOD_DAYS") {
            config.ledger.sweep.grace_period_days = parse_var("COOP_GRACE_PERIOD_DAYS", &days)?;
        }
        if let Some(hours) = var("COOP_SWEEP_INTERVAL_HOURS") {
            config.ledger.sweep.interval_hours = parse_var("COOP_SWEEP_INTERVAL_HOURS", &hours)?;
        }
        if let Some(hours) = var("COOP_DISTRIBUTION_INTERVAL_HOURS") {
            config.ledger.distribution.interval_hours =
                parse_var("COOP_DISTRIBUTION_INTERVAL_HOURS", &hours)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        info!("Loading configuration from {}", path.display());

        let contents = fs::read_to_string(path).map_err(|e| {
            ConfigError::FileReadError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: NodeConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ledger.validate()?;
        debug!("Configuration valid, database at {}", self.database_path.display());
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnvVar(name.to_string(), e.to_string()))
}
