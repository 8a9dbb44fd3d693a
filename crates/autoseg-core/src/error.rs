//! Error types for a supervised segmentation job.
//!
//! Every variant is fatal to the job: the runner stops at the first error,
//! emits the attached diagnostic context, runs cleanup, and exits with
//! [`JobError::exit_code`].

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that terminate a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// One or more required parameters were absent or empty.
    #[error("missing required parameter(s): {}", keys.join(", "))]
    MissingParameter {
        /// Every absent key, in canonical order.
        keys: Vec<String>,
    },

    /// A parameter was present but malformed.
    #[error("invalid parameter {key}: {reason}")]
    InvalidParameter {
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An external tool could not be located.
    #[error("tool unavailable: {tool}")]
    ToolUnavailable {
        /// Program name as configured.
        tool: String,
    },

    /// Schema migrations exited non-zero.
    #[error("schema migration failed ({status}): {output}")]
    MigrationFailed {
        /// Rendered exit status.
        status: String,
        /// Tail of the tool's combined output.
        output: String,
    },

    /// The job database does not exist (or cannot be queried) after migration.
    #[error("database not created at {}: {reason}", path.display())]
    DatabaseNotCreated {
        /// Expected database file.
        path: PathBuf,
        /// What was observed.
        reason: String,
    },

    /// The external model registry directory is absent.
    #[error("model registry missing at {}", path.display())]
    ModelRegistryMissing {
        /// The configured registry source directory.
        path: PathBuf,
    },

    /// The model registry is reachable but empty.
    #[error("no models found in {}", path.display())]
    NoModelsFound {
        /// The configured registry source directory.
        path: PathBuf,
    },

    /// The worker exited (or never started) within the startup grace period.
    #[error("worker failed to start: {reason}\n--- worker log tail ---\n{log_tail}")]
    WorkerStartupFailed {
        /// Spawn error or exit status.
        reason: String,
        /// Redacted tail of the captured worker log.
        log_tail: String,
    },

    /// The input archive could not be transferred.
    #[error("download of {uri} failed: {reason}")]
    DownloadFailed {
        /// Remote archive location.
        uri: String,
        /// Transport error.
        reason: String,
    },

    /// The transfer reported success but nothing usable landed locally.
    #[error("input archive at {} is empty or missing", path.display())]
    EmptyOrMissingInput {
        /// Expected local archive path.
        path: PathBuf,
    },

    /// The archive extractor exited non-zero.
    #[error("extraction of {} failed ({status}): {output}", archive.display())]
    ExtractionFailed {
        /// Local archive path.
        archive: PathBuf,
        /// Rendered exit status.
        status: String,
        /// Tail of the extractor's combined output.
        output: String,
    },

    /// A staged file could not be moved into the watch directory.
    #[error("failed to relocate {} into watch directory: {reason}", file.display())]
    RelocationFailed {
        /// The staged file that failed to move.
        file: PathBuf,
        /// Underlying I/O error.
        reason: String,
    },

    /// A bounded wait exhausted its budget.
    #[error("timed out waiting for {phase} after {attempts} check(s)\n{diagnostics}")]
    PhaseTimeout {
        /// The wait description.
        phase: String,
        /// Number of predicate evaluations performed.
        attempts: u32,
        /// External state captured at failure time.
        diagnostics: String,
    },

    /// The artifact was absent or zero-length when publication was attempted.
    #[error("output artifact {} is missing or empty", path.display())]
    OutputMissingOrEmpty {
        /// Local artifact path.
        path: PathBuf,
    },

    /// The artifact upload failed.
    #[error("upload to {uri} failed: {reason}")]
    UploadFailed {
        /// Remote destination.
        uri: String,
        /// Transport error.
        reason: String,
    },

    /// The remote object could not be confirmed after upload.
    #[error("upload to {uri} could not be verified: {reason}")]
    UploadVerificationFailed {
        /// Remote destination.
        uri: String,
        /// What the existence check reported.
        reason: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unexpected local filesystem failure.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A termination signal was intercepted.
    #[error("interrupted by signal {signal}")]
    Interrupted {
        /// Raw signal number.
        signal: i32,
    },

    /// The whole-job upper bound elapsed.
    #[error("job exceeded its overall deadline of {}", humantime::format_duration(*limit))]
    DeadlineExceeded {
        /// The configured job timeout.
        limit: std::time::Duration,
    },
}

impl JobError {
    /// Creates an I/O error with context.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an invalid parameter error.
    #[must_use]
    pub fn invalid_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this failure.
    ///
    /// Signals follow the shell convention of `128 + signal`; everything
    /// else is a plain failure.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted { signal } => 128 + *signal,
            _ => 1,
        }
    }

    /// Short machine-friendly name of the variant, used in log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MissingParameter { .. } => "missing_parameter",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::ToolUnavailable { .. } => "tool_unavailable",
            Self::MigrationFailed { .. } => "migration_failed",
            Self::DatabaseNotCreated { .. } => "database_not_created",
            Self::ModelRegistryMissing { .. } => "model_registry_missing",
            Self::NoModelsFound { .. } => "no_models_found",
            Self::WorkerStartupFailed { .. } => "worker_startup_failed",
            Self::DownloadFailed { .. } => "download_failed",
            Self::EmptyOrMissingInput { .. } => "empty_or_missing_input",
            Self::ExtractionFailed { .. } => "extraction_failed",
            Self::RelocationFailed { .. } => "relocation_failed",
            Self::PhaseTimeout { .. } => "phase_timeout",
            Self::OutputMissingOrEmpty { .. } => "output_missing_or_empty",
            Self::UploadFailed { .. } => "upload_failed",
            Self::UploadVerificationFailed { .. } => "upload_verification_failed",
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Interrupted { .. } => "interrupted",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
        }
    }
}
