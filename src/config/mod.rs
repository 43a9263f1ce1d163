//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod alerting;
mod pipeline;
mod storage;

pub use alerting::{AlertingConfig, WebhookConfig};
pub use pipeline::{InputConfig, LoadConfig, QualityConfig, RetentionConfig, DEFAULT_INPUT_PATH};
pub use storage::{PostgresConfig, SqliteConfig, StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "usage-ingest.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "USAGE_INGEST_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "USAGE_INGEST";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "USAGE_INGEST_LOG";
/// Environment variable selecting log output format (`json` or text).
pub const LOG_FORMAT_ENV_VAR: &str = "USAGE_INGEST_LOG_FORMAT";

/// Legacy: input file path.
pub const CSV_FILE_PATH_ENV_VAR: &str = "CSV_FILE_PATH";
/// Legacy: PostgreSQL connection URL.
pub const DATABASE_URL_ENV_VAR: &str = "DATABASE_URL";
/// Legacy: retention on/off (`true` enables).
pub const ENABLE_RETENTION_ENV_VAR: &str = "ENABLE_RETENTION_POLICY";
/// Legacy: retention horizon in months.
pub const RETENTION_MONTHS_ENV_VAR: &str = "RETENTION_PERIOD_MONTHS";

use serde::Deserialize;

/// Errors raised while loading or validating configuration.
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
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Input file layout.
    pub input: InputConfig,
    /// Bulk load batching.
    pub load: LoadConfig,
    /// Quality gate settings.
    pub quality: QualityConfig,
    /// Retention policy.
    pub retention: RetentionConfig,
    /// Alert delivery.
    pub alerting: AlertingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `usage-ingest.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy deployment variables (`CSV_FILE_PATH`, `DATABASE_URL`, ...)
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

        builder = builder.add_source(
            Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Ok(csv_path) = std::env::var(CSV_FILE_PATH_ENV_VAR) {
            builder = builder.set_override("input.path", csv_path)?;
        }
        if let Ok(url) = std::env::var(DATABASE_URL_ENV_VAR) {
            if url.starts_with("postgres") {
                builder = builder.set_override("storage.type", "postgres")?;
            }
            builder = builder.set_override("storage.postgres.uri", url)?;
        }
        if let Ok(enabled) = std::env::var(ENABLE_RETENTION_ENV_VAR) {
            builder =
                builder.set_override("retention.enabled", enabled.eq_ignore_ascii_case("true"))?;
        }
        if let Ok(months) = std::env::var(RETENTION_MONTHS_ENV_VAR) {
            let months: i64 = months.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be an integer", RETENTION_MONTHS_ENV_VAR))
            })?;
            builder = builder.set_override("retention.months", months)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.sample_rows == 0 {
            return Err(ConfigError::Invalid("input.sample_rows must be at least 1".into()));
        }
        if self.load.staging_batch_rows == 0 || self.load.merge_batch_rows == 0 {
            return Err(ConfigError::Invalid("load batch sizes must be at least 1".into()));
        }
        if self.quality.window_hours <= 0 {
            return Err(ConfigError::Invalid("quality.window_hours must be positive".into()));
        }
        if self.retention.enabled && self.retention.months == 0 {
            return Err(ConfigError::Invalid("retention.months must be at least 1".into()));
        }
        if let Some(webhook) = &self.alerting.webhook {
            if webhook.endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "alerting.webhook.endpoint must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.sqlite.path = ":memory:".to_string();
        config.storage.connect_attempts = 1;
        config
    }
}
