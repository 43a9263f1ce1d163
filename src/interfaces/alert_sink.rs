//! Alert delivery interface.

use async_trait::async_trait;
use serde::Serialize;

/// How urgently a human should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Data-quality findings; the run still succeeded.
    Warning,
    /// The run aborted.
    Critical,
}

/// A notification about one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub summary: String,
    pub severity: Severity,
    /// One human-readable line per finding.
    pub issues: Vec<String>,
    /// Structured context (run id, counts, stage).
    pub detail: serde_json::Value,
}

impl Alert {
    pub fn new(summary: impl Into<String>, severity: Severity) -> Self {
        Self {
            summary: summary.into(),
            severity,
            issues: Vec::new(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Plain-text body listing every issue.
    pub fn body(&self) -> String {
        let mut body =
            String::from("The following issues were detected during the usage ingest run:\n");
        for issue in &self.issues {
            body.push_str("\n- ");
            body.push_str(issue);
        }
        body
    }
}

/// Errors raised by an alert sink.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert sink not configured: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert rejected with status {0}")]
    Rejected(u16),
}

/// Destination for alerts.
///
/// Delivery is best-effort: callers go through
/// [`crate::alert::notify_best_effort`], which logs and drops failures.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_body_lists_issues() {
        let alert = Alert::new("Quality issues", Severity::Warning)
            .with_issues(vec!["a".to_string(), "b".to_string()]);
        let body = alert.body();
        assert!(body.ends_with("\n- a\n- b"));
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        let json = serde_json::to_value(Severity::Critical).unwrap();
        assert_eq!(json, serde_json::json!("critical"));
    }
}
