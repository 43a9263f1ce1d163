//! Staging loader.
//!
//! Streams parsed records into the run's staging table through the store's
//! bulk path. Staging rows carry only an ordinal, never an identity.

use tracing::{debug, info, warn};

use super::RunContext;
use crate::error::PipelineError;
use crate::interfaces::{StagingWriter, UsageStore};
use crate::parser::RowError;
use crate::record::{StagingRow, UsageRecord};

/// Load `records` into `ctx.staging`.
///
/// Malformed rows are skipped and counted. A read failure aborts the load and
/// leaves the fact table untouched. Zero rows is not an error.
pub async fn stage_records<I>(
    store: &dyn UsageStore,
    ctx: &mut RunContext,
    records: I,
    batch_rows: usize,
) -> Result<u64, PipelineError>
where
    I: Iterator<Item = Result<UsageRecord, RowError>>,
{
    store
        .create_staging(&ctx.staging)
        .await
        .map_err(PipelineError::Staging)?;
    let mut writer = store
        .open_staging_writer(&ctx.staging)
        .await
        .map_err(PipelineError::Staging)?;

    let batch_rows = batch_rows.max(1);
    let mut batch: Vec<StagingRow> = Vec::with_capacity(batch_rows);
    let mut seq: i64 = 0;

    for item in records {
        ctx.counters.rows_read += 1;
        match item {
            Ok(record) => {
                seq += 1;
                batch.push(StagingRow { seq, record });
            }
            Err(e) if e.is_fatal() => {
                abort(writer, &e.to_string()).await;
                return Err(PipelineError::InputRead(e));
            }
            Err(e) => {
                ctx.counters.rows_malformed += 1;
                warn!(run_id = %ctx.run_id, line = e.line, error = %e.kind, "Skipping malformed row");
                continue;
            }
        }

        if batch.len() >= batch_rows {
            if let Err(e) = writer.write(&batch).await {
                abort(writer, &e.to_string()).await;
                return Err(PipelineError::Staging(e));
            }
            debug!(run_id = %ctx.run_id, rows = batch.len(), "Staged batch");
            batch.clear();
        }
    }

    if !batch.is_empty() {
        if let Err(e) = writer.write(&batch).await {
            abort(writer, &e.to_string()).await;
            return Err(PipelineError::Staging(e));
        }
    }

    let staged = writer.finish().await.map_err(PipelineError::Staging)?;
    if staged != seq as u64 {
        warn!(
            run_id = %ctx.run_id,
            sent = seq,
            staged,
            "Store accepted a different number of staged rows than were sent"
        );
    }
    ctx.counters.rows_staged = staged;

    if staged == 0 {
        info!(run_id = %ctx.run_id, table = %ctx.staging, "No valid rows to stage");
    } else {
        info!(
            run_id = %ctx.run_id,
            table = %ctx.staging,
            rows_read = ctx.counters.rows_read,
            rows_malformed = ctx.counters.rows_malformed,
            rows_staged = staged,
            "Staging load complete"
        );
    }
    Ok(staged)
}

async fn abort(writer: Box<dyn StagingWriter>, reason: &str) {
    if let Err(e) = writer.abort(reason).await {
        warn!(error = %e, "Failed to abort staging load");
    }
}
