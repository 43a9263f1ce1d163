//! Bootstrap utilities for the ingest binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};

/// Initialize tracing with the USAGE_INGEST_LOG environment variable.
///
/// Defaults to "info" level if USAGE_INGEST_LOG is not set. Output is JSON
/// lines when USAGE_INGEST_LOG_FORMAT is `json`, human-readable otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
