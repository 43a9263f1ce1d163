//! Usage store interface.
//!
//! The store owns three kinds of objects:
//! - the durable fact table, keyed by `event_uuid`
//! - one staging table per run, disposable at any time
//! - the fact table's secondary indexes, which carry no state of their own
//!
//! Stage code talks to the store only through these traits so that each
//! stage can be exercised against the in-memory mock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::record::{FactRow, StagingRow};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Cannot decode column {column}: {reason}")]
    Decode { column: &'static str, reason: String },

    #[error("Staging table not found: {0}")]
    StagingNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Name of a run-scoped staging table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagingTable(String);

/// Prefix shared by every staging table.
pub const STAGING_TABLE_PREFIX: &str = "usage_staging_";

impl StagingTable {
    /// Staging table for a run. Only ASCII alphanumerics and `_` survive
    /// from the run id so the name is always a safe bare identifier.
    pub fn for_run(run_id: &str) -> Result<Self> {
        let suffix: String = run_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if suffix.is_empty() {
            return Err(StorageError::InvalidIdentifier(run_id.to_string()));
        }
        // PostgreSQL truncates identifiers at 63 bytes
        let mut name = format!("{}{}", STAGING_TABLE_PREFIX, suffix);
        name.truncate(63);
        Ok(Self(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StagingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A non-unique secondary index as recorded in the store catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SecondaryIndex {
    pub name: String,
    /// Full `CREATE INDEX` statement that rebuilds the index.
    pub definition: String,
}

/// Null counts for the critical columns inside the recency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CriticalNullCounts {
    pub rows_checked: u64,
    pub missing_customer_id: u64,
    pub missing_event_start_time: u64,
    pub missing_event_type: u64,
    /// Rows with at least one critical null.
    pub rows_with_any: u64,
}

/// Interface for the usage fact store.
///
/// Implementations:
/// - `PostgresUsageStore`: PostgreSQL (COPY-based staging)
/// - `SqliteUsageStore`: SQLite (standalone runs and tests)
/// - `MockUsageStore`: in-memory, for stage unit tests
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Create the fact table and its secondary indexes if they do not exist.
    async fn ensure_schema(&self) -> Result<()>;

    /// Create any catalogued secondary index that is missing.
    ///
    /// Recovery path for a merge that died between dropping and rebuilding.
    async fn ensure_secondary_indexes(&self) -> Result<()>;

    /// Secondary indexes currently present on the fact table, sorted by name.
    async fn list_secondary_indexes(&self) -> Result<Vec<SecondaryIndex>>;

    /// Create (or recreate, empty) a run's staging table.
    async fn create_staging(&self, table: &StagingTable) -> Result<()>;

    /// Open the bulk-load path into a staging table.
    async fn open_staging_writer(&self, table: &StagingTable) -> Result<Box<dyn StagingWriter>>;

    /// Drop a staging table. Missing tables are not an error.
    async fn drop_staging(&self, table: &StagingTable) -> Result<()>;

    /// Start the merge transaction.
    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>>;

    /// Critical-null counts over rows loaded at or after `loaded_since`.
    async fn critical_null_counts(&self, loaded_since: DateTime<Utc>) -> Result<CriticalNullCounts>;

    /// Rows whose event start is later than `now`, across the whole table.
    async fn future_dated_count(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete rows whose event start is strictly before `cutoff`, in one
    /// transaction. Returns the number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Create or replace the analytics views.
    async fn refresh_views(&self) -> Result<()>;

    /// Total rows in the fact table.
    async fn fact_count(&self) -> Result<u64>;
}

/// Bulk-load session into one staging table.
#[async_trait]
pub trait StagingWriter: Send {
    /// Append rows.
    async fn write(&mut self, rows: &[StagingRow]) -> Result<()>;

    /// Complete the load. Returns the rows the store accepted.
    async fn finish(self: Box<Self>) -> Result<u64>;

    /// Abandon the load; nothing written becomes visible.
    async fn abort(self: Box<Self>, reason: &str) -> Result<()>;
}

/// The merge transaction. Nothing done through it is visible until `commit`.
#[async_trait]
pub trait MergeTransaction: Send {
    /// Secondary indexes as seen inside the transaction, sorted by name.
    async fn secondary_indexes(&mut self) -> Result<Vec<SecondaryIndex>>;

    async fn drop_index(&mut self, name: &str) -> Result<()>;

    async fn create_index(&mut self, index: &SecondaryIndex) -> Result<()>;

    /// Up to `limit` staged rows with `seq > after_seq`, ordered by `seq`.
    async fn fetch_staged(
        &mut self,
        table: &StagingTable,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StagingRow>>;

    /// Insert rows, silently skipping any whose `event_uuid` already exists
    /// (including earlier rows of the same batch). Returns rows inserted.
    async fn insert_or_ignore(&mut self, rows: &[FactRow]) -> Result<u64>;

    /// A failed commit discards the transaction; nothing stays open.
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
