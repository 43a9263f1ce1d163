//! Alert sinks.
//!
//! Every alert is logged. When a webhook is configured it also receives the
//! alert as JSON. Delivery failures never propagate into the pipeline.

mod mock;
mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

pub use mock::RecordingAlertSink;
pub use webhook::WebhookAlertSink;

use crate::config::AlertingConfig;
use crate::interfaces::{Alert, AlertError, AlertSink, Severity};

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.severity {
            Severity::Warning => warn!(
                summary = %alert.summary,
                issues = alert.issues.len(),
                detail = %alert.detail,
                "ALERT TRIGGERED\n{}",
                alert.body()
            ),
            Severity::Critical => error!(
                summary = %alert.summary,
                issues = alert.issues.len(),
                detail = %alert.detail,
                "ALERT TRIGGERED\n{}",
                alert.body()
            ),
        }
        Ok(())
    }
}

/// Delivers each alert to every inner sink.
///
/// All sinks are attempted; the first failure is returned after the rest ran.
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Build the configured sink chain.
pub fn build_alert_sink(config: &AlertingConfig) -> Result<Arc<dyn AlertSink>, AlertError> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    if let Some(webhook) = &config.webhook {
        sinks.push(Arc::new(WebhookAlertSink::new(webhook.clone())?));
    }
    Ok(Arc::new(FanoutAlertSink::new(sinks)))
}

/// Send an alert, logging instead of failing if the sink errors.
pub async fn notify_best_effort(sink: &dyn AlertSink, alert: &Alert) {
    if let Err(e) = sink.notify(alert).await {
        error!(summary = %alert.summary, error = %e, "Failed to deliver alert");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fanout_reaches_every_sink_even_after_failure() {
        let failing = Arc::new(RecordingAlertSink::failing());
        let recording = Arc::new(RecordingAlertSink::new());
        let fanout = FanoutAlertSink::new(vec![failing.clone(), recording.clone()]);

        let result = fanout
            .notify(&Alert::new("summary", Severity::Warning))
            .await;

        assert!(result.is_err());
        assert_eq!(failing.alerts().await.len(), 1);
        assert_eq!(recording.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_notify_best_effort_swallows_failures() {
        let failing = RecordingAlertSink::failing();
        notify_best_effort(&failing, &Alert::new("summary", Severity::Critical)).await;
        assert_eq!(failing.alerts().await.len(), 1);
    }

    #[test]
    fn test_build_alert_sink_without_webhook() {
        assert!(build_alert_sink(&AlertingConfig::default()).is_ok());
    }
}
