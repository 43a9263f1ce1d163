//! Merge engine.
//!
//! Moves the run's staged rows into the fact table inside one store
//! transaction:
//! 1. capture and drop the fact table's secondary indexes
//! 2. page through staging in ordinal order, assign each row its
//!    `event_uuid` and insert-or-ignore it
//! 3. rebuild every captured index from its recorded definition
//! 4. commit
//!
//! Any failure rolls the whole transaction back, which also restores the
//! dropped indexes on stores with transactional DDL. As a second line of
//! recovery the catalogued indexes are then re-ensured outside the
//! transaction.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::RunContext;
use crate::error::PipelineError;
use crate::interfaces::{MergeTransaction, Result, SecondaryIndex, StagingTable, UsageStore};
use crate::record::FactRow;

/// Counts reported by one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub staged: u64,
    pub inserted: u64,
    /// Staged rows whose identity was already present.
    pub skipped: u64,
    pub indexes_rebuilt: usize,
}

/// Secondary indexes dropped for the duration of a bulk insert.
///
/// Must be released with [`IndexSuspension::restore`] before commit. If the
/// merge fails instead, rolling back the transaction releases it.
#[must_use = "dropped indexes must be restored before commit"]
struct IndexSuspension {
    dropped: Vec<SecondaryIndex>,
}

impl IndexSuspension {
    async fn acquire(tx: &mut dyn MergeTransaction) -> Result<Self> {
        let dropped = tx.secondary_indexes().await?;
        for index in &dropped {
            debug!(index = %index.name, "Dropping secondary index");
            tx.drop_index(&index.name).await?;
        }
        Ok(Self { dropped })
    }

    async fn restore(self, tx: &mut dyn MergeTransaction) -> Result<usize> {
        for index in &self.dropped {
            debug!(index = %index.name, "Recreating secondary index");
            tx.create_index(index).await?;
        }
        Ok(self.dropped.len())
    }
}

/// Merge the run's staging table into the fact table.
pub async fn merge_staged(
    store: &dyn UsageStore,
    ctx: &mut RunContext,
    batch_rows: usize,
) -> std::result::Result<MergeOutcome, PipelineError> {
    let started = Instant::now();
    let mut tx = store.begin_merge().await.map_err(PipelineError::Merge)?;

    let result = merge_in(tx.as_mut(), &ctx.staging, ctx.started_at, batch_rows.max(1)).await;
    let result = match result {
        Ok(outcome) => tx.commit().await.map(|()| outcome),
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(run_id = %ctx.run_id, error = %rollback, "Merge rollback failed");
            }
            Err(e)
        }
    };

    match result {
        Ok(outcome) => {
            ctx.counters.rows_inserted = outcome.inserted;
            ctx.counters.rows_skipped = outcome.skipped;
            info!(
                run_id = %ctx.run_id,
                staged = outcome.staged,
                inserted = outcome.inserted,
                skipped = outcome.skipped,
                indexes_rebuilt = outcome.indexes_rebuilt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Merge committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            error!(run_id = %ctx.run_id, error = %e, "Merge aborted, rolled back");
            recover_indexes(store).await;
            Err(PipelineError::Merge(e))
        }
    }
}

async fn merge_in(
    tx: &mut dyn MergeTransaction,
    staging: &StagingTable,
    loaded_at: DateTime<Utc>,
    batch_rows: usize,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();

    let mut page = tx.fetch_staged(staging, 0, batch_rows).await?;
    if page.is_empty() {
        info!(table = %staging, "Staging is empty, nothing to merge");
        return Ok(outcome);
    }

    let suspension = IndexSuspension::acquire(tx).await?;
    info!(count = suspension.dropped.len(), "Secondary indexes dropped for bulk insert");

    loop {
        let last_seq = page.last().map(|row| row.seq).unwrap_or_default();
        let full_page = page.len() >= batch_rows;
        outcome.staged += page.len() as u64;

        let facts: Vec<FactRow> = page
            .into_iter()
            .map(|row| FactRow::from_record(row.record, loaded_at))
            .collect();
        outcome.inserted += tx.insert_or_ignore(&facts).await?;

        if !full_page {
            break;
        }
        page = tx.fetch_staged(staging, last_seq, batch_rows).await?;
        if page.is_empty() {
            break;
        }
    }

    outcome.skipped = outcome.staged.saturating_sub(outcome.inserted);
    outcome.indexes_rebuilt = suspension.restore(tx).await?;
    Ok(outcome)
}

async fn recover_indexes(store: &dyn UsageStore) {
    match store.ensure_secondary_indexes().await {
        Ok(()) => info!("Secondary indexes re-ensured after failed merge"),
        Err(e) => error!(
            error = %e,
            "Secondary indexes may be missing; they are recreated on the next run"
        ),
    }
}
