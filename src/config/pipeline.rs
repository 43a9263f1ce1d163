//! Pipeline stage configuration types.

use serde::Deserialize;

/// Default input path when neither config nor CLI names one.
pub const DEFAULT_INPUT_PATH: &str = "/app/data/usage_sample.csv";

/// Input file layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Path of the delimited export.
    pub path: String,
    /// Column delimiter.
    pub delimiter: char,
    /// Skip the first line.
    pub has_header: bool,
    /// Leading rows checked for column count before ingestion starts.
    pub sample_rows: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_INPUT_PATH.to_string(),
            delimiter: ',',
            has_header: false,
            sample_rows: 5,
        }
    }
}

/// Bulk load batching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Records buffered per write to the staging area.
    pub staging_batch_rows: usize,
    /// Staged rows read and merged per round trip.
    pub merge_batch_rows: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            staging_batch_rows: 5_000,
            merge_batch_rows: 5_000,
        }
    }
}

/// Post-merge quality checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Width of the recency window for the critical-null check.
    pub window_hours: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self { window_hours: 24 }
    }
}

/// Age-based retention.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Rows whose event start is more than this many calendar months old are deleted.
    pub months: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            months: 6,
        }
    }
}
