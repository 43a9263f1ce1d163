//! Alerting configuration types.

use serde::Deserialize;

/// Alert delivery configuration. Alerts are always logged; a webhook is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub webhook: Option<WebhookConfig>,
}

/// HTTP webhook receiving alerts as JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Endpoint URL.
    pub endpoint: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Delivery attempts before the alert is dropped.
    pub max_attempts: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_secs: 10,
            max_attempts: 3,
        }
    }
}
