//! Engine configuration.
//!
//! Layered: built-in defaults, then an optional TOML/JSON/YAML file, then
//! `PATIENT_SYNC_*` environment variables (e.g. `PATIENT_SYNC_MAX_CONCURRENT_LANES=8`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "PATIENT_SYNC";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Per-request timeout for remote calls
    pub request_timeout_ms: u64,
    /// First retry delay after a transient failure
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling
    pub retry_max_delay_ms: u64,
    /// Attempts after which a warning event is published (retries continue)
    pub retry_warning_threshold: u32,
    /// Background sweep period while online
    pub sweep_interval_ms: u64,
    /// Patients dispatched concurrently during a pass
    pub max_concurrent_lanes: usize,
    /// Pull server changes after draining the log
    pub pull_on_sync: bool,
    /// Broadcast channel capacity for event receivers
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            request_timeout_ms: 10_000,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 60_000,
            retry_warning_threshold: 5,
            sweep_interval_ms: 30_000,
            max_concurrent_lanes: 4,
            pull_on_sync: true,
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// In-memory configuration with defaults.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Defaults with a database file.
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Load from defaults, `file` (if given) and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(::config::File::from(file).required(true));
        }
        let config: SyncConfig = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.request_timeout_ms == 0 {
            return invalid("request_timeout_ms must be positive");
        }
        if self.retry_base_delay_ms == 0 {
            return invalid("retry_base_delay_ms must be positive");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return invalid("retry_max_delay_ms must not be below retry_base_delay_ms");
        }
        if self.retry_warning_threshold == 0 {
            return invalid("retry_warning_threshold must be at least 1");
        }
        if self.sweep_interval_ms == 0 {
            return invalid("sweep_interval_ms must be positive");
        }
        if self.max_concurrent_lanes == 0 {
            return invalid("max_concurrent_lanes must be at least 1");
        }
        if self.event_buffer == 0 {
            return invalid("event_buffer must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_concurrent_lanes, 4);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "request_timeout_ms = 2500").unwrap();
        writeln!(file, "pull_on_sync = false").unwrap();
        writeln!(file, "database_path = \"/tmp/patients.db\"").unwrap();

        let config = SyncConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.request_timeout_ms, 2500);
        assert!(!config.pull_on_sync);
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/patients.db")));
        // Untouched keys keep their defaults
        assert_eq!(config.retry_base_delay_ms, 500);
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("PATIENT_SYNC_SWEEP_INTERVAL_MS", "1234");
        let config = SyncConfig::load(None).unwrap();
        std::env::remove_var("PATIENT_SYNC_SWEEP_INTERVAL_MS");
        assert_eq!(config.sweep_interval_ms, 1234);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = SyncConfig::load(Some(Path::new("/nonexistent/patient-sync.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SyncConfig {
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 10,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SyncConfig {
            max_concurrent_lanes: 0,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
