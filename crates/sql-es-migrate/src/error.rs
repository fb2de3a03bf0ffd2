//! Error types for the migration library.

use thiserror::Error;

use crate::state::JobId;

/// Per-record transform failure. Routed to the dead-letter store, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field '{field}': {message}")]
pub struct TransformError {
    /// Target field (or rule target path) that could not be produced.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl TransformError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing or invalid mapping, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A single record could not be transformed.
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// A bulk write failed as a whole.
    #[error("Load failed for index {index} after {attempts} attempt(s): {message}")]
    LoadBatch {
        index: String,
        attempts: u32,
        message: String,
    },

    /// Source or target system unreachable.
    #[error("{system} connectivity error: {message}")]
    Connectivity { system: String, message: String },

    /// Unknown job id.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// Control operation not allowed in the job's current status.
    #[error("Cannot {action} job {job}: job is {from}")]
    InvalidTransition {
        job: JobId,
        from: String,
        action: String,
    },

    /// Dead-letter store failure.
    #[error("Dead-letter store error: {0}")]
    DeadLetter(String),

    /// Job or watermark persistence failure.
    #[error("State error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled (SIGINT, stop request, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Connectivity error for the named system.
    pub fn connectivity(system: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Connectivity {
            system: system.into(),
            message: message.to_string(),
        }
    }

    /// Create a Connectivity error for a pool failure while doing `context`.
    pub fn pool(system: impl Into<String>, e: impl std::fmt::Display, context: &str) -> Self {
        MigrateError::Connectivity {
            system: system.into(),
            message: format!("{}: {}", context, e),
        }
    }

    /// Create a LoadBatch error.
    pub fn load_batch(index: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        MigrateError::LoadBatch {
            index: index.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Whether a retry policy may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::LoadBatch { .. } | MigrateError::Connectivity { .. }
        )
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 1,
            MigrateError::Connectivity { .. } => 2,
            MigrateError::LoadBatch { .. } => 3,
            MigrateError::Transform(_) => 4,
            MigrateError::JobNotFound(_) | MigrateError::InvalidTransition { .. } => 5,
            MigrateError::Cancelled => 6,
            MigrateError::Io(_) => 7,
            MigrateError::DeadLetter(_) | MigrateError::State(_) | MigrateError::Json(_) => 8,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(e: reqwest::Error) -> Self {
        MigrateError::connectivity("target", e)
    }
}

impl From<tokio_postgres::Error> for MigrateError {
    fn from(e: tokio_postgres::Error) -> Self {
        MigrateError::connectivity("source", e)
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
