//! Result and error types for the core library

use std::time::Duration;

use thiserror::Error;

use super::report::ExecutionReport;

/// Core library error type
///
/// Parse and planning errors are raised before the target database is
/// touched. Execution errors are recorded in the ledger before they surface.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Precondition failed for {changeset}: {message}")]
    Precondition { changeset: String, message: String },

    #[error(
        "Checksum mismatch for {changeset}: recorded {recorded}, declared {declared}. \
         The changeset was modified after it was applied"
    )]
    ChecksumMismatch {
        changeset: String,
        recorded: String,
        declared: String,
    },

    #[error(
        "Could not acquire the migration lock within {}s (held by {holder}). \
         If no other process is migrating, release it with `changeline release-locks`",
        waited.as_secs()
    )]
    LockTimeout { holder: String, waited: Duration },

    #[error("Changeset {changeset} failed: {message}")]
    ChangeSetExecution { changeset: String, message: String },

    /// A run stopped part way; `report` holds what it did before stopping
    #[error("Migration failed: {source}")]
    MigrationFailure {
        #[source]
        source: Box<Error>,
        report: Box<ExecutionReport>,
    },

    #[error("Rollback error: {0}")]
    Rollback(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a parse error for a changelog path
    pub fn parse(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Partial report carried by a halted migration, if any
    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            Self::MigrationFailure { report, .. } => Some(&**report),
            _ => None,
        }
    }

    /// The error that stopped a run, looking through `MigrationFailure`
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::MigrationFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Core library result type
pub type Result<T> = std::result::Result<T, Error>;
