//! Retention enforcer.

use chrono::{DateTime, Months, Utc};
use tracing::info;

use super::RunContext;
use crate::config::RetentionConfig;
use crate::error::PipelineError;
use crate::interfaces::{StorageError, UsageStore};

/// Result of the retention stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionOutcome {
    /// Retention is disabled.
    Skipped,
    Applied {
        cutoff: DateTime<Utc>,
        deleted: u64,
    },
}

/// Oldest event start time that survives retention.
///
/// `months` calendar months before `now`, clamped to the end of shorter
/// months. A row exactly at the cutoff is kept.
pub fn retention_cutoff(now: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_months(Months::new(months))
}

/// Delete fact rows older than the configured horizon, in one transaction.
///
/// Failure leaves the already committed merge in place.
pub async fn enforce_retention(
    store: &dyn UsageStore,
    ctx: &mut RunContext,
    config: &RetentionConfig,
) -> Result<RetentionOutcome, PipelineError> {
    if !config.enabled {
        info!(run_id = %ctx.run_id, "Retention skipped (disabled in config)");
        return Ok(RetentionOutcome::Skipped);
    }

    let cutoff = retention_cutoff(ctx.started_at, config.months).ok_or_else(|| {
        PipelineError::Retention(StorageError::Backend(format!(
            "retention horizon of {} months is out of range",
            config.months
        )))
    })?;

    info!(run_id = %ctx.run_id, months = config.months, cutoff = %cutoff, "Applying retention");
    let deleted = store
        .delete_older_than(cutoff)
        .await
        .map_err(PipelineError::Retention)?;
    ctx.counters.rows_deleted = deleted;

    info!(run_id = %ctx.run_id, deleted, "Retention applied");
    Ok(RetentionOutcome::Applied { cutoff, deleted })
}
