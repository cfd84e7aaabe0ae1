//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod processing;
mod storage;

pub use messaging::{AmqpBusConfig, MessagingConfig, MessagingType};
pub use processing::{LedgerConfig, OutboxConfig, ProcessingConfig};
pub use storage::{PostgresConfig, SqliteConfig, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONVEYOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CONVEYOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONVEYOR_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatch loop and retry configuration.
    pub processing: ProcessingConfig,
    /// Idempotency ledger retention.
    pub ledger: LedgerConfig,
    /// Outbox relay configuration.
    pub outbox: OutboxConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g.
    ///    `CONVEYOR__PROCESSING__MAX_RETRY_ATTEMPTS=5`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no file or env sources).
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config: Config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.processing.workers == 0 {
            return Err(ConfigError::Invalid(
                "processing.workers must be at least 1".to_string(),
            ));
        }
        if self.processing.backoff_cap_ms < self.processing.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "processing.backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.processing.backoff_cap_ms, self.processing.backoff_base_ms
            )));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "outbox.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.processing.max_retry_attempts, 10);
        assert_eq!(config.storage.storage_type, StorageType::Sqlite);
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_overrides_defaults() {
        let config = Config::from_yaml(
            r#"
processing:
  workers: 2
  max_retry_attempts: 5
  backoff_base_ms: 10
  backoff_cap_ms: 1000
ledger:
  retention_window_secs: 60
outbox:
  relay_poll_interval_ms: 250
storage:
  type: postgres
  postgres:
    uri: postgres://db/conveyor
messaging:
  type: amqp
  amqp:
    url: amqp://rabbit:5672
    queue: widgets
"#,
        )
        .unwrap();

        assert_eq!(config.processing.workers, 2);
        assert_eq!(config.processing.max_retry_attempts, 5);
        assert_eq!(config.ledger.retention_window_secs, 60);
        assert_eq!(config.outbox.relay_poll_interval_ms, 250);
        assert_eq!(config.outbox.batch_size, 100);
        assert_eq!(config.storage.storage_type, StorageType::Postgres);
        assert_eq!(config.storage.postgres.uri, "postgres://db/conveyor");
        assert_eq!(config.messaging.messaging_type, MessagingType::Amqp);
        assert_eq!(config.messaging.amqp.queue, "widgets");
        assert_eq!(config.messaging.amqp.exchange, "conveyor.events");
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let err = Config::from_yaml(
            r#"
processing:
  backoff_base_ms: 5000
  backoff_cap_ms: 10
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Config::from_yaml("processing:\n  workers: 0\n").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("CONVEYOR__PROCESSING__MAX_RETRY_ATTEMPTS", "3");
        std::env::set_var("CONVEYOR__OUTBOX__BATCH_SIZE", "7");
        let config = Config::load(None);
        std::env::remove_var("CONVEYOR__PROCESSING__MAX_RETRY_ATTEMPTS");
        std::env::remove_var("CONVEYOR__OUTBOX__BATCH_SIZE");

        let config = config.unwrap();
        assert_eq!(config.processing.max_retry_attempts, 3);
        assert_eq!(config.outbox.batch_size, 7);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/conveyor.yaml")).is_err());
    }
}
