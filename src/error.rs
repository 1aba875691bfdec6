use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures that stop a dataset or the whole run. Row-level problems never
/// surface here; they are counted in the run report instead.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("source unavailable: {path}: {message}")]
    SourceUnavailable { path: PathBuf, message: String },

    #[error("structural failure: {0}")]
    StructuralFailure(String),
}

impl From<StoreError> for LoadError {
    fn from(err: StoreError) -> Self {
        LoadError::StructuralFailure(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store busy: {0}")]
    Busy(String),

    #[error("batch exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Busy and timed-out batches are retried row by row instead of failing the run.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Timeout(_))
    }
}

/// Why the field decoder turned a raw row away.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("missing required field {column}")]
    MissingField { column: &'static str },

    #[error("unparsable {column}: '{raw}'")]
    InvalidField { column: &'static str, raw: String },

    #[error("{column} out of range: '{raw}'")]
    OutOfRange { column: &'static str, raw: String },
}
