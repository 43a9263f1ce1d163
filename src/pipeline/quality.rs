//! Post-merge quality gate.
//!
//! Two checks run after every merge:
//! - critical nulls: rows loaded inside the recency window with a null
//!   customer id, event start time or event type
//! - future-dated events: rows anywhere in the table whose event start is
//!   later than the run's processing time
//!
//! Violations are logged and raised as one warning alert. They never fail
//! the run and never touch data.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tracing::{info, warn};

use super::RunContext;
use crate::alert::notify_best_effort;
use crate::interfaces::{Alert, AlertSink, CriticalNullCounts, Severity, UsageStore};

/// Summary line of the quality alert.
pub const QUALITY_ALERT_SUMMARY: &str = "Usage ingest: data quality issues found";

/// The checks the gate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityCheck {
    CriticalNull,
    FutureDated,
}

impl QualityCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCheck::CriticalNull => "critical_null",
            QualityCheck::FutureDated => "future_dated",
        }
    }
}

impl std::fmt::Display for QualityCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub check: QualityCheck,
    /// Offending rows. Zero when the check itself could not run.
    pub rows: u64,
    /// Human-readable line for the alert.
    pub message: String,
}

/// What the gate found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QualityReport {
    pub critical_nulls: Option<CriticalNullCounts>,
    pub future_dated: Option<u64>,
    pub violations: Vec<Violation>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Start of the recency window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window_hours: i64) -> DateTime<Utc> {
    TimeDelta::try_hours(window_hours)
        .and_then(|width| now.checked_sub_signed(width))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Run every check and alert once if any failed.
pub async fn run_quality_gate(
    store: &dyn UsageStore,
    alerts: &dyn AlertSink,
    ctx: &mut RunContext,
    window_hours: i64,
) -> QualityReport {
    let now = ctx.started_at;
    let since = window_start(now, window_hours);
    let mut report = QualityReport::default();

    info!(run_id = %ctx.run_id, window_start = %since, "Running quality checks");

    match store.critical_null_counts(since).await {
        Ok(counts) => {
            report.critical_nulls = Some(counts);
            if counts.rows_with_any > 0 {
                report.violations.push(Violation {
                    check: QualityCheck::CriticalNull,
                    rows: counts.rows_with_any,
                    message: format!(
                        "Missing values (cust/time/type): {}/{}/{} in {} recent rows",
                        counts.missing_customer_id,
                        counts.missing_event_start_time,
                        counts.missing_event_type,
                        counts.rows_checked
                    ),
                });
            }
        }
        Err(e) => report.violations.push(Violation {
            check: QualityCheck::CriticalNull,
            rows: 0,
            message: format!("Quality check {} could not run: {}", QualityCheck::CriticalNull, e),
        }),
    }

    match store.future_dated_count(now).await {
        Ok(count) => {
            report.future_dated = Some(count);
            if count > 0 {
                report.violations.push(Violation {
                    check: QualityCheck::FutureDated,
                    rows: count,
                    message: format!("Future-dated events: {}", count),
                });
            }
        }
        Err(e) => report.violations.push(Violation {
            check: QualityCheck::FutureDated,
            rows: 0,
            message: format!("Quality check {} could not run: {}", QualityCheck::FutureDated, e),
        }),
    }

    ctx.counters.quality_violations = report.violations.len() as u64;

    if report.passed() {
        info!(run_id = %ctx.run_id, "Quality checks passed");
        return report;
    }

    for violation in &report.violations {
        warn!(
            run_id = %ctx.run_id,
            check = violation.check.as_str(),
            violations = violation.rows,
            "{}",
            violation.message
        );
    }

    let alert = Alert::new(QUALITY_ALERT_SUMMARY, Severity::Warning)
        .with_issues(report.violations.iter().map(|v| v.message.clone()).collect())
        .with_detail(json!({
            "run_id": ctx.run_id,
            "window_hours": window_hours,
            "window_start": since.to_rfc3339(),
            "critical_nulls": report.critical_nulls.map(|c| json!({
                "rows_checked": c.rows_checked,
                "missing_customer_id": c.missing_customer_id,
                "missing_event_start_time": c.missing_event_start_time,
                "missing_event_type": c.missing_event_type,
            })),
            "future_dated": report.future_dated,
        }));
    notify_best_effort(alerts, &alert).await;

    report
}
