//! usage-ingest: load one usage export into the fact store.
//!
//! ## Configuration
//! - `--config` / USAGE_INGEST_CONFIG: YAML configuration file
//! - USAGE_INGEST__<SECTION>__<KEY>: individual overrides
//! - CSV_FILE_PATH, DATABASE_URL, ENABLE_RETENTION_POLICY,
//!   RETENTION_PERIOD_MONTHS: legacy deployment variables
//! - USAGE_INGEST_LOG: tracing filter (default: info)
//!
//! Exit status is 0 on success (quality warnings included) and one of the
//! documented non-zero codes otherwise.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::{info, warn};

use usage_ingest::alert::{build_alert_sink, LogAlertSink};
use usage_ingest::config::Config;
use usage_ingest::interfaces::AlertSink;
use usage_ingest::pipeline::{connect, report_failure, Pipeline};
use usage_ingest::utils::bootstrap::init_tracing;
use usage_ingest::{ExitCode, PipelineError};

/// Run the usage ingest pipeline.
#[derive(Parser, Debug)]
#[command(name = "usage-ingest", version, about)]
struct Args {
    /// Input file. Overrides `input.path` and CSV_FILE_PATH.
    #[arg(long = "csv-path", value_name = "PATH")]
    csv_path: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();
    let code = run(args).await;
    std::process::exit(code.as_i32());
}

async fn run(args: Args) -> ExitCode {
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let err = PipelineError::from(e);
            report_failure(&LogAlertSink, &err, json!({ "stage": err.stage() })).await;
            return err.exit_code();
        }
    };

    let alerts: Arc<dyn AlertSink> = match build_alert_sink(&config.alerting) {
        Ok(sink) => sink,
        Err(e) => {
            warn!(error = %e, "Alert webhook unavailable, alerts go to the log only");
            Arc::new(LogAlertSink)
        }
    };

    let input = match args.csv_path {
        Some(path) => {
            info!(path = %path.display(), "Using input path from command line");
            path
        }
        None => {
            info!(path = %config.input.path, "Using input path from configuration");
            PathBuf::from(&config.input.path)
        }
    };

    let store = match connect(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            let detail = json!({
                "stage": e.stage(),
                "storage": config.storage.storage_type.to_string(),
            });
            report_failure(alerts.as_ref(), &e, detail).await;
            return e.exit_code();
        }
    };
    info!(storage = %config.storage.storage_type, "Store connection established");

    let pipeline = Pipeline::new(store, alerts, config);
    match pipeline.run(&input).await {
        Ok(_) => ExitCode::Success,
        Err(e) => e.exit_code(),
    }
}
