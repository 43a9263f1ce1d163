//! Load-merge pipeline.
//!
//! One run takes one input file through:
//! 1. structure validation
//! 2. schema setup
//! 3. staging load
//! 4. merge (identity assignment, insert-or-ignore, index suspension)
//! 5. quality gate (non-fatal)
//! 6. analytics view refresh
//! 7. retention
//!
//! Stages are fail-fast. A fatal error is logged with the counters gathered
//! so far, raised as one critical alert and returned to the caller. The run
//! state lives in a [`RunContext`] that is threaded through every stage.

pub mod merge;
pub mod quality;
pub mod retention;
pub mod staging;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use merge::{merge_staged, MergeOutcome};
pub use quality::{run_quality_gate, QualityCheck, QualityReport, Violation};
pub use retention::{enforce_retention, retention_cutoff, RetentionOutcome};
pub use staging::stage_records;

use crate::alert::notify_best_effort;
use crate::config::{Config, StorageConfig};
use crate::error::PipelineError;
use crate::interfaces::{Alert, AlertSink, Severity, StagingTable, StorageError, UsageStore};
use crate::parser;
use crate::storage::init_storage;

/// Counters gathered across one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub rows_read: u64,
    pub rows_malformed: u64,
    pub rows_staged: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub quality_violations: u64,
    pub rows_deleted: u64,
}

/// State of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    /// Processing time of the run. Written as `loaded_at` on inserted rows
    /// and used as "now" by the quality gate and retention.
    pub started_at: DateTime<Utc>,
    pub staging: StagingTable,
    pub counters: RunCounters,
}

impl RunContext {
    /// A fresh run starting at `started_at`.
    pub fn new(started_at: DateTime<Utc>) -> Result<Self, StorageError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!("{}_{}", started_at.format("%Y%m%d%H%M%S"), &suffix[..8]);
        Self::for_run(&run_id, started_at)
    }

    pub fn for_run(run_id: &str, started_at: DateTime<Utc>) -> Result<Self, StorageError> {
        Ok(Self {
            run_id: run_id.to_string(),
            started_at,
            staging: StagingTable::for_run(run_id)?,
            counters: RunCounters::default(),
        })
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub counters: RunCounters,
    pub merge: MergeOutcome,
    pub quality: QualityReport,
    pub retention: RetentionOutcome,
}

/// Connect to the configured store.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn UsageStore>, PipelineError> {
    init_storage(config).await.map_err(PipelineError::Connection)
}

/// Log a fatal error and raise the critical alert for it.
pub async fn report_failure(alerts: &dyn AlertSink, err: &PipelineError, detail: serde_json::Value) {
    error!(stage = err.stage(), error = %err, detail = %detail, "Usage ingest aborted");
    let alert = Alert::new(err.alert_summary(), Severity::Critical)
        .with_issues(vec![err.to_string()])
        .with_detail(detail);
    notify_best_effort(alerts, &alert).await;
}

fn step_completed(step: &str, started: Instant) {
    info!(step, elapsed_ms = started.elapsed().as_millis() as u64, "Step completed");
}

/// The pipeline orchestrator.
pub struct Pipeline {
    store: Arc<dyn UsageStore>,
    alerts: Arc<dyn AlertSink>,
    config: Config,
}

impl Pipeline {
    pub fn new(store: Arc<dyn UsageStore>, alerts: Arc<dyn AlertSink>, config: Config) -> Self {
        Self {
            store,
            alerts,
            config,
        }
    }

    /// Run the pipeline over `input`, starting now.
    pub async fn run(&self, input: &Path) -> Result<RunReport, PipelineError> {
        let mut ctx = RunContext::new(Utc::now()).map_err(PipelineError::Staging)?;
        self.run_with_context(input, &mut ctx).await
    }

    /// Run the pipeline with an explicit run context.
    pub async fn run_with_context(
        &self,
        input: &Path,
        ctx: &mut RunContext,
    ) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        info!(
            run_id = %ctx.run_id,
            input = %input.display(),
            retention_enabled = self.config.retention.enabled,
            retention_months = self.config.retention.months,
            "Starting usage ingest run"
        );

        match self.execute(input, ctx).await {
            Ok(report) => {
                info!(
                    run_id = %ctx.run_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    rows_staged = ctx.counters.rows_staged,
                    rows_inserted = ctx.counters.rows_inserted,
                    rows_skipped = ctx.counters.rows_skipped,
                    quality_violations = ctx.counters.quality_violations,
                    "Usage ingest run completed"
                );
                Ok(report)
            }
            Err(e) => {
                let detail = json!({
                    "run_id": ctx.run_id,
                    "stage": e.stage(),
                    "input": input.display().to_string(),
                    "counters": ctx.counters,
                });
                report_failure(self.alerts.as_ref(), &e, detail).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, input: &Path, ctx: &mut RunContext) -> Result<RunReport, PipelineError> {
        let store = self.store.as_ref();

        let step = Instant::now();
        parser::validate_structure(input, &self.config.input)?;
        step_completed("validate_input", step);

        let step = Instant::now();
        store.ensure_schema().await.map_err(PipelineError::Schema)?;
        step_completed("schema", step);

        let step = Instant::now();
        let records = parser::open_records(input, &self.config.input)?;
        let staged = stage_records(store, ctx, records, self.config.load.staging_batch_rows).await;
        if let Err(e) = staged {
            self.drop_staging(ctx).await;
            return Err(e);
        }
        step_completed("staging", step);

        let step = Instant::now();
        let merged = merge_staged(store, ctx, self.config.load.merge_batch_rows).await;
        self.drop_staging(ctx).await;
        let merge = merged?;
        step_completed("merge", step);

        let step = Instant::now();
        let quality = run_quality_gate(
            store,
            self.alerts.as_ref(),
            ctx,
            self.config.quality.window_hours,
        )
        .await;
        step_completed("quality", step);

        let step = Instant::now();
        store.refresh_views().await.map_err(PipelineError::Views)?;
        step_completed("views", step);

        let step = Instant::now();
        let retention = enforce_retention(store, ctx, &self.config.retention).await?;
        step_completed("retention", step);

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            counters: ctx.counters,
            merge,
            quality,
            retention,
        })
    }

    /// Staging is disposable; failing to drop it is not fatal.
    async fn drop_staging(&self, ctx: &RunContext) {
        if let Err(e) = self.store.drop_staging(&ctx.staging).await {
            warn!(run_id = %ctx.run_id, table = %ctx.staging, error = %e, "Failed to drop staging table");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::storage::MockUsageStore;
    use chrono::TimeZone;
    use std::io::Write;

    const ROW_A: &str = "1001,2024-06-30 10:00:00+00,VOICE,7,0,1,60.5,0.25,2024-06";
    const ROW_B: &str = "1002,2024-06-30 11:00:00+00,DATA,8,0,0,120,1.5,2024-06";
    const ROW_NULL_CUSTOMER: &str = ",2024-06-30 12:00:00+00,SMS,7,0,0,1,0.05,2024-06";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 30, 0).unwrap()
    }

    fn input(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    fn pipeline(store: &MockUsageStore, alerts: &Arc<RecordingAlertSink>, config: Config) -> Pipeline {
        Pipeline::new(Arc::new(store.clone()), alerts.clone(), config)
    }

    #[test]
    fn test_run_context_names_staging_after_run() {
        let ctx = RunContext::new(now()).unwrap();
        assert!(ctx.run_id.starts_with("20240701093000_"));
        assert_eq!(ctx.staging.name(), format!("usage_staging_{}", ctx.run_id));
    }

    #[tokio::test]
    async fn test_run_merges_and_cleans_staging() {
        let store = MockUsageStore::new();
        let alerts = Arc::new(RecordingAlertSink::new());
        let file = input(&[ROW_A, ROW_A, ROW_B]);
        let mut ctx = RunContext::for_run("run1", now()).unwrap();

        let report = pipeline(&store, &alerts, Config::for_test())
            .run_with_context(file.path(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(report.merge.inserted, 2);
        assert_eq!(report.merge.skipped, 1);
        assert!(report.quality.passed());
        assert_eq!(report.retention, RetentionOutcome::Skipped);
        assert!(store.staging_tables().await.is_empty());
        assert_eq!(store.views_refreshed().await, 1);
        assert!(alerts.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_quality_violation_does_not_block_retention() {
        let store = MockUsageStore::new();
        let alerts = Arc::new(RecordingAlertSink::new());
        let mut config = Config::for_test();
        config.retention.enabled = true;
        let file = input(&[ROW_A, ROW_NULL_CUSTOMER]);
        let mut ctx = RunContext::for_run("run2", now()).unwrap();

        let report = pipeline(&store, &alerts, config)
            .run_with_context(file.path(), &mut ctx)
            .await
            .unwrap();

        assert_eq!(report.quality.violations.len(), 1);
        assert!(matches!(report.retention, RetentionOutcome::Applied { .. }));
        let sent = alerts.alerts().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].summary, quality::QUALITY_ALERT_SUMMARY);
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_store_mutation() {
        let store = MockUsageStore::new();
        let alerts = Arc::new(RecordingAlertSink::new());
        let mut ctx = RunContext::for_run("run3", now()).unwrap();

        let err = pipeline(&store, &alerts, Config::for_test())
            .run_with_context(Path::new("/nonexistent/usage.csv"), &mut ctx)
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "input");
        assert!(store.indexes().await.is_empty());
        let sent = alerts.alerts().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[0].detail["stage"], "input");
    }

    #[tokio::test]
    async fn test_merge_failure_drops_staging_and_alerts() {
        let store = MockUsageStore::new();
        store.set_fail_on_insert(true).await;
        let alerts = Arc::new(RecordingAlertSink::new());
        let file = input(&[ROW_A]);
        let mut ctx = RunContext::for_run("run4", now()).unwrap();

        let err = pipeline(&store, &alerts, Config::for_test())
            .run_with_context(file.path(), &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Merge(_)));
        assert!(store.staging_tables().await.is_empty());
        assert_eq!(store.fact_count().await.unwrap(), 0);
        assert_eq!(alerts.alerts().await[0].detail["counters"]["rows_staged"], 1);
    }

    #[tokio::test]
    async fn test_view_failure_keeps_committed_merge() {
        let store = MockUsageStore::new();
        store.set_fail_on_views(true).await;
        let alerts = Arc::new(RecordingAlertSink::new());
        let file = input(&[ROW_A, ROW_B]);
        let mut ctx = RunContext::for_run("run5", now()).unwrap();

        let err = pipeline(&store, &alerts, Config::for_test())
            .run_with_context(file.path(), &mut ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Views(_)));
        assert_eq!(store.fact_count().await.unwrap(), 2);
    }
}
