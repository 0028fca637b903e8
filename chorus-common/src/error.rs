//! Common error types for the orchestration engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the Artifact Store, Deduplication Index,
/// Access View and Job Queue.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing blob: {0}")]
    MissingBlob(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error taxonomy used by Stage Runners to classify the outcome of an
/// external call, independent of the Rust error type that carried it.
///
/// Serialized verbatim onto the wire in `Failed` progress events, so
/// variant names are the stable, user-facing vocabulary from the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    RateLimited,
    SourceTooLong,
    UploadTooLarge,
    BadInput,
    CodecFailure,
    SeparatorFailure,
    AnalyzerFailure,
    OutOfResource,
    StorageFailure,
    Interrupted,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    /// Whether a Stage Runner should re-enqueue on this outcome, per §7's
    /// propagation policy. `OutOfResource` is re-queued by the Job Queue
    /// itself rather than the runner, so it is not "retryable" here.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SourceTooLong => "source_too_long",
            ErrorKind::UploadTooLarge => "upload_too_large",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::CodecFailure => "codec_failure",
            ErrorKind::SeparatorFailure => "separator_failure",
            ErrorKind::AnalyzerFailure => "analyzer_failure",
            ErrorKind::OutOfResource => "out_of_resource",
            ErrorKind::StorageFailure => "storage_failure",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A classified failure: the taxonomy kind plus a short, user-safe message.
/// Stack traces and adapter logs are logged via `tracing`, never placed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub brief_message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, brief_message: impl Into<String>) -> Self {
        Self {
            kind,
            brief_message: brief_message.into(),
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.brief_message)
    }
}

impl std::error::Error for ClassifiedError {}
