//! Error types for dropline-core

use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dropline-core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dropline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Local file to upload does not exist
    #[error("Local file not found: {0}")]
    LocalFileNotFound(PathBuf),

    /// Upload batch already holds the maximum number of commits
    #[error("Upload batch is full ({capacity} entries), call finish_batch to commit it")]
    BatchFull { capacity: usize },

    /// Nothing queued in the upload batch
    #[error("Upload batch is empty, have you uploaded any files yet?")]
    EmptyBatch,

    /// Terminal HTTP failure returned by the API
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// A tagged reply carried a tag we do not handle
    #[error("Unexpected '{tag}' reply from {endpoint}")]
    UnexpectedTag { endpoint: String, tag: String },

    /// Server-side batch job reported failure
    #[error("Upload batch job failed: {0}")]
    JobFailed(String),

    /// Token check did not echo our query back
    #[error("Authentication failed: token is invalid")]
    InvalidToken,

    /// Remote path does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure (connect, TLS, protocol)
    #[error("HTTP client error: {0}")]
    Http(String),

    /// Timeout
    #[error("Operation timed out")]
    Timeout,

    /// Cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidConfig(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors detected before any request was sent.
    pub fn is_local_precondition(&self) -> bool {
        matches!(
            self,
            Error::LocalFileNotFound(_) | Error::BatchFull { .. } | Error::EmptyBatch
        )
    }

    /// The API error, if this is one.
    pub fn as_api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(err.to_string())
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

/// Body of a failed API response
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorBody {
    Text(String),
    Json(Value),
}

impl ErrorBody {
    /// Structured view of the body; text that happens to be JSON counts too.
    pub fn as_json(&self) -> Option<Value> {
        match self {
            ErrorBody::Json(value) => Some(value.clone()),
            ErrorBody::Text(text) => serde_json::from_str(text).ok(),
        }
    }
}

/// Terminal failure decided by the request executor.
///
/// Carries no retry semantics of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, body: ErrorBody) -> Self {
        Self { status, body }
    }

    /// Discriminant of a tagged error union: `error[".tag"]`.
    pub fn tag(&self) -> Option<String> {
        self.body
            .as_json()?
            .get("error")?
            .get(".tag")?
            .as_str()
            .map(str::to_string)
    }

    /// Human-readable `error_summary`, when the API sent one.
    pub fn summary(&self) -> Option<String> {
        self.body
            .as_json()?
            .get("error_summary")?
            .as_str()
            .map(str::to_string)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.as_u16();
        if let Some(tag) = self.tag() {
            return write!(f, "{} {}", status, tag);
        }
        if let Some(summary) = self.summary() {
            return write!(f, "{} {}", status, summary);
        }
        match &self.body {
            ErrorBody::Text(text) => write!(f, "{} {}", status, text),
            ErrorBody::Json(value) => write!(f, "{} {}", status, value),
        }
    }
}

impl std::error::Error for ApiError {}
