//! Pipeline error taxonomy and process exit codes.
//!
//! Every fatal condition surfaces as a [`PipelineError`]. The orchestrator
//! logs it, raises one critical alert, and the binary exits with
//! [`PipelineError::exit_code`]. Quality violations are not errors.

use crate::config::ConfigError;
use crate::interfaces::StorageError;
use crate::parser::{ParseError, RowError};

/// Exit codes for the ingest binary. Stable, for scheduler consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Run completed (quality warnings included)
    Success = 0,

    /// Configuration could not be loaded or is invalid
    ConfigError = 10,

    /// Input file missing, empty, structurally wrong or unreadable
    InputError = 11,

    /// Store unreachable
    ConnectionError = 12,

    /// Schema, staging, merge or view failure
    StoreError = 13,

    /// Retention delete failed (merge already committed)
    RetentionError = 14,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Fatal pipeline failures.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] ParseError),

    #[error("Input read error: {0}")]
    InputRead(#[source] RowError),

    #[error("Store connection failed: {0}")]
    Connection(#[source] StorageError),

    #[error("Schema setup failed: {0}")]
    Schema(#[source] StorageError),

    #[error("Staging load failed: {0}")]
    Staging(#[source] StorageError),

    #[error("Merge failed: {0}")]
    Merge(#[source] StorageError),

    #[error("Analytics view refresh failed: {0}")]
    Views(#[source] StorageError),

    #[error("Retention failed: {0}")]
    Retention(#[source] StorageError),
}

impl PipelineError {
    /// Name of the stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Input(_) | PipelineError::InputRead(_) => "input",
            PipelineError::Connection(_) => "connect",
            PipelineError::Schema(_) => "schema",
            PipelineError::Staging(_) => "staging",
            PipelineError::Merge(_) => "merge",
            PipelineError::Views(_) => "views",
            PipelineError::Retention(_) => "retention",
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            PipelineError::Config(_) => ExitCode::ConfigError,
            PipelineError::Input(_) | PipelineError::InputRead(_) => ExitCode::InputError,
            PipelineError::Connection(_) => ExitCode::ConnectionError,
            PipelineError::Schema(_)
            | PipelineError::Staging(_)
            | PipelineError::Merge(_)
            | PipelineError::Views(_) => ExitCode::StoreError,
            PipelineError::Retention(_) => ExitCode::RetentionError,
        }
    }

    /// One-line alert summary for operators.
    pub fn alert_summary(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "Usage ingest critical failure: configuration error",
            PipelineError::Input(ParseError::NotFound { .. }) => {
                "Usage ingest critical failure: input file missing"
            }
            PipelineError::Input(_) | PipelineError::InputRead(_) => {
                "Usage ingest critical failure: input validation error"
            }
            PipelineError::Connection(_) => "Usage ingest critical failure: store unreachable",
            PipelineError::Schema(_) | PipelineError::Staging(_) | PipelineError::Views(_) => {
                "Usage ingest critical failure: database error"
            }
            PipelineError::Merge(_) => "Usage ingest critical failure: merge aborted",
            PipelineError::Retention(_) => "Usage ingest critical failure: retention aborted",
        }
    }
}
