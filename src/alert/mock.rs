//! Recording alert sink for tests.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::interfaces::{Alert, AlertError, AlertSink};

/// Keeps every alert it receives. Optionally fails after recording.
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: RwLock<Vec<Alert>>,
    fail: bool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.write().await.push(alert.clone());
        if self.fail {
            return Err(AlertError::Rejected(503));
        }
        Ok(())
    }
}
