//! Storage implementations.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::{StorageError, UsageStore};
use crate::utils::retry::{connection_backoff, is_retryable_connect_error};

pub mod mock;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockUsageStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresUsageStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{fetch_facts, SqliteUsageStore};

/// Connect to the configured store.
///
/// Transient connection failures are retried with exponential backoff up to
/// `connect_attempts` times. Schema creation is left to the pipeline.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn UsageStore>, StorageError> {
    match &config.storage_type {
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            use sqlx::postgres::PgPoolOptions;

            info!(storage = %config.storage_type, "Connecting to store");
            let uri = config.postgres.uri.clone();
            let pool = (|| {
                let uri = uri.clone();
                async move {
                    PgPoolOptions::new()
                        .max_connections(5)
                        .acquire_timeout(Duration::from_secs(30))
                        .connect(&uri)
                        .await
                }
            })
            .retry(connection_backoff(config.connect_attempts))
            .when(is_retryable_connect_error)
            .notify(|err: &sqlx::Error, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Store connection failed, retrying");
            })
            .await?;

            Ok(Arc::new(PostgresUsageStore::new(pool)))
        }
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            use std::str::FromStr;

            use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

            let path = config.sqlite.path.as_str();
            info!(storage = %config.storage_type, path, "Connecting to store");

            let in_memory = path == ":memory:";
            let (opts, max_connections) = if in_memory {
                // Every connection to :memory: is a separate database
                (SqliteConnectOptions::from_str("sqlite::memory:")?, 1)
            } else {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
                }
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(30))
                    .create_if_missing(true);
                (opts, 5)
            };

            let pool = (|| {
                let opts = opts.clone();
                async move {
                    SqlitePoolOptions::new()
                        .max_connections(max_connections)
                        .idle_timeout(None)
                        .max_lifetime(None)
                        .connect_with(opts)
                        .await
                }
            })
            .retry(connection_backoff(config.connect_attempts))
            .when(is_retryable_connect_error)
            .notify(|err: &sqlx::Error, dur: Duration| {
                warn!(error = %err, delay = ?dur, "Store connection failed, retrying");
            })
            .await?;

            Ok(Arc::new(SqliteUsageStore::new(pool)))
        }
        #[allow(unreachable_patterns)]
        other => Err(StorageError::Backend(format!(
            "{} storage requested but the '{}' feature is not enabled",
            other, other
        ))),
    }
}
