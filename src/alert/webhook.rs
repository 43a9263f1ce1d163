//! HTTP webhook alert sink.
//!
//! POSTs each alert as a JSON document to a configured endpoint, retrying
//! timeouts, connection failures, 429 and 5xx responses with backoff.

use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::WebhookConfig;
use crate::interfaces::{Alert, AlertError, AlertSink};
use crate::utils::retry::alert_backoff;

/// Wire format posted to the webhook.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    alert: &'a Alert,
    body: String,
}

/// Webhook alert sink.
pub struct WebhookAlertSink {
    client: Client,
    config: WebhookConfig,
}

impl WebhookAlertSink {
    /// Create a new webhook sink with the given configuration.
    pub fn new(config: WebhookConfig) -> Result<Self, AlertError> {
        if config.endpoint.is_empty() {
            return Err(AlertError::Config(
                "webhook endpoint not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    /// Determine if an HTTP error is retryable.
    fn is_retryable(err: &AlertError) -> bool {
        match err {
            AlertError::Http(e) => e.is_timeout() || e.is_connect(),
            AlertError::Rejected(status) => Self::is_retryable_status(*status),
            AlertError::Config(_) => false,
        }
    }

    /// Retry 429 (rate limit) and 5xx (server errors).
    fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    async fn post(&self, alert: &Alert) -> Result<(), AlertError> {
        let payload = WebhookPayload {
            alert,
            body: alert.body(),
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(endpoint = %self.config.endpoint, summary = %alert.summary, "Alert posted");
            Ok(())
        } else {
            warn!(
                endpoint = %self.config.endpoint,
                status = %status,
                "Alert webhook returned error status"
            );
            Err(AlertError::Rejected(status.as_u16()))
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        (|| async { self.post(alert).await })
            .retry(alert_backoff(self.config.max_attempts))
            .when(Self::is_retryable)
            .await
    }
}
