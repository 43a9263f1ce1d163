//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for store connection attempts at startup.
///
/// - Min delay: 200ms
/// - Max delay: 5s
/// - Retries: `attempts - 1` (the first try is not a retry)
/// - Jitter enabled
pub fn connection_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

/// Backoff for alert webhook delivery.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Retries: `attempts - 1`
/// - Jitter enabled
pub fn alert_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

/// Determines if a connection error is worth retrying.
///
/// Retryable: I/O failures, pool timeouts, TLS handshakes.
/// Non-retryable: configuration mistakes and server-side rejections
/// (bad credentials, unknown database) that will fail again identically.
pub fn is_retryable_connect_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
    )
}
