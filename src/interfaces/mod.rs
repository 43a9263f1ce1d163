//! Abstract interfaces for the ingest pipeline.
//!
//! These traits define the contracts for:
//! - Usage storage (staging, merge, quality queries, retention)
//! - Alert delivery

pub mod alert_sink;
pub mod usage_store;

pub use alert_sink::{Alert, AlertError, AlertSink, Severity};
pub use usage_store::{
    CriticalNullCounts, MergeTransaction, Result, SecondaryIndex, StagingTable, StagingWriter,
    StorageError, UsageStore, STAGING_TABLE_PREFIX,
};
