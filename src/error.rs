//! Error types for dataset-archiver
//!
//! This module provides the error taxonomy for an archive run:
//! - Per-task fetch failures (recorded in the run summary, never fatal)
//! - Depositor/backend failures (fatal for the run, draft left intact)
//! - Publish failures (never retried automatically)
//! - Resume precondition violations (fail fast before touching the draft)
//!
//! Every error maps to a stable machine-readable code via [`Error::error_code`],
//! which is what failure records in a [`RunSummary`](crate::summary::RunSummary) carry.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::PartitionKey;

/// Result type alias for dataset-archiver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dataset-archiver
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_fetches")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error from the HTTP client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A remote server answered with a non-success HTTP status
    #[error("HTTP {status} from {url}")]
    Http {
        /// Status code returned by the server
        status: u16,
        /// URL that was requested
        url: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Staged archive could not be listed or extracted
    #[error("invalid archive {path}: {reason}")]
    InvalidArchive {
        /// Path of the staged archive
        path: PathBuf,
        /// What went wrong while reading it
        reason: String,
    },

    /// Downloaded payload is an HTML page where data was expected
    #[error("unexpected HTML payload from {url}")]
    UnexpectedHtml {
        /// URL that served the page
        url: String,
    },

    /// Fetch failed after exhausting the retry budget
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Depositor/backend error during draft mutation or lookup
    #[error("depositor error: {0}")]
    Depositor(#[from] DepositorError),

    /// Backend rejected publication of a draft
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// A resumed run cannot safely continue
    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),

    /// Insufficient disk space in the staging area
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Run was cancelled by the operator or a timeout
    #[error("run cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::InvalidArchive {
            path: PathBuf::new(),
            reason: e.to_string(),
        }
    }
}

/// Permanent failure of a single fetch task
#[derive(Debug, Error)]
#[error("partition {partition} failed after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    /// Partition the task was supposed to produce
    pub partition: PartitionKey,
    /// Display text of the final underlying error
    pub cause: String,
    /// Machine-readable code of the final underlying error
    pub code: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
}

/// Depositor/backend errors
#[derive(Debug, Error)]
pub enum DepositorError {
    /// Backend API answered with an error status
    #[error("backend returned {status}: {message}")]
    Api {
        /// HTTP status (or 0 for non-HTTP backends)
        status: u16,
        /// Message extracted from the response body
        message: String,
    },

    /// No deposition is known for the dataset
    #[error("no deposition found for dataset {dataset}")]
    DepositionNotFound {
        /// The dataset that was looked up
        dataset: String,
    },

    /// Draft handle does not refer to an open draft
    #[error("draft {draft} is not open")]
    DraftNotOpen {
        /// Backend-specific draft identifier
        draft: String,
    },

    /// File is not present in the draft
    #[error("file {filename} not found in draft {draft}")]
    FileNotFound {
        /// Backend-specific draft identifier
        draft: String,
        /// Name of the missing file
        filename: String,
    },

    /// Backend response did not contain what the protocol requires
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),

    /// Draft contents after reconciliation do not match what was uploaded
    #[error("draft {draft} does not hold the uploaded content for: {}", .files.join(", "))]
    DraftDiverged {
        /// Backend-specific draft identifier
        draft: String,
        /// Files whose listed fingerprint or size differs, or that are missing or extra
        files: Vec<String>,
    },
}

/// Publication failures
#[derive(Debug, Error)]
pub enum PublishError {
    /// Backend refused to publish the draft (e.g. missing metadata)
    #[error("backend rejected draft {draft}: {message}")]
    Rejected {
        /// Backend-specific draft identifier
        draft: String,
        /// Rejection message from the backend
        message: String,
    },

    /// Draft carries no publish action
    #[error("draft {draft} has no publish link")]
    MissingPublishLink {
        /// Backend-specific draft identifier
        draft: String,
    },
}

/// Resume precondition violations
#[derive(Debug, Error)]
pub enum ResumeError {
    /// Draft changed since the failed run recorded it
    #[error("draft {draft} was modified since the previous run (expected digest {expected}, found {found})")]
    DraftMutated {
        /// Backend-specific draft identifier
        draft: String,
        /// Digest recorded in the previous run summary
        expected: String,
        /// Digest of the draft as it is now
        found: String,
    },

    /// Backend handed out a different draft than the one recorded
    #[error("expected to resume draft {expected}, backend returned {found}")]
    DraftMismatch {
        /// Draft id recorded in the previous run summary
        expected: String,
        /// Draft id returned by the backend
        found: String,
    },

    /// Previous run cannot be resumed (e.g. it already published or discarded)
    #[error("run {run_id} cannot be resumed: {reason}")]
    NotResumable {
        /// Run id of the previous summary
        run_id: String,
        /// Why it cannot be resumed
        reason: String,
    },

    /// Previous summary is for a different dataset
    #[error("summary is for dataset {found}, not {expected}")]
    DatasetMismatch {
        /// Dataset configured for this run
        expected: String,
        /// Dataset recorded in the summary
        found: String,
    },
}

impl Error {
    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Http { .. } => "http_error",
            Error::Serialization(_) => "serialization_error",
            Error::InvalidArchive { .. } => "invalid_archive",
            Error::UnexpectedHtml { .. } => "unexpected_html",
            Error::Fetch(_) => "fetch_failed",
            Error::Depositor(e) => match e {
                DepositorError::Api { .. } => "backend_api_error",
                DepositorError::DepositionNotFound { .. } => "deposition_not_found",
                DepositorError::DraftNotOpen { .. } => "draft_not_open",
                DepositorError::FileNotFound { .. } => "file_not_found",
                DepositorError::MalformedResponse(_) => "malformed_response",
                DepositorError::DraftDiverged { .. } => "draft_diverged",
            },
            Error::Publish(e) => match e {
                PublishError::Rejected { .. } => "publish_rejected",
                PublishError::MissingPublishLink { .. } => "missing_publish_link",
            },
            Error::Resume(e) => match e {
                ResumeError::DraftMutated { .. } => "draft_mutated",
                ResumeError::DraftMismatch { .. } => "draft_mismatch",
                ResumeError::NotResumable { .. } => "not_resumable",
                ResumeError::DatasetMismatch { .. } => "dataset_mismatch",
            },
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }

    /// Shorthand for a configuration error on a specific key
    pub(crate) fn config(message: impl Into<String>, key: &str) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
