//! Usage ingest - idempotent load-merge pipeline for telecom usage exports.
//!
//! Reads a delimited usage export, bulk-loads it into a per-run staging
//! table, merges it into a fact table keyed by a content hash, checks the
//! fresh data, refreshes the analytics views and applies retention.

pub mod alert;
pub mod config;
pub mod error;
pub mod identity;
pub mod interfaces;
pub mod parser;
pub mod pipeline;
pub mod record;
pub mod storage;
pub mod utils;

pub use error::{ExitCode, PipelineError};
pub use pipeline::{Pipeline, RunContext, RunReport};
