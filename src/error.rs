//! Error types for the resilience layer
//!
//! Two levels of error live here. [`OperationError`] is what a single remote
//! call produces and is what the retry executor classifies. [`Error`] is the
//! crate-level error returned by the caller-facing conveniences (config
//! loading, `raise_on_failure`, aborted batches).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::RetryConfig;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level failure kinds. All of them are retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The per-attempt deadline expired
    Timeout,
    /// Connection refused or reset
    Connect,
    /// Any other transport failure (DNS, TLS, broken pipe...)
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Timeout => write!(f, "timeout"),
            TransportKind::Connect => write!(f, "connect"),
            TransportKind::Other => write!(f, "transport"),
        }
    }
}

/// Error produced by one invocation of an [`Operation`](crate::operation::Operation).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    /// Connection or timeout failure; always retryable
    #[error("{kind} error: {message}")]
    Transport { kind: TransportKind, message: String },

    /// The remote service answered with a non-success status
    #[error("[{status}] {message}")]
    Http { status: u16, message: String },

    /// The request or response was rejected locally
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The rate limiter refused a token under the `error` strategy
    #[error("rate limit exceeded ({rate} req/s), available tokens: {available:.2}")]
    RateLimitExceeded { rate: f64, available: f64 },

    /// Writing a successful payload to disk failed
    #[error("failed to persist {}: {message}", path.display())]
    Persist { path: PathBuf, message: String },

    /// The batch was cancelled before this call could be made
    #[error("cancelled")]
    Cancelled,
}

/// Retry classification of an observed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl OperationError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportKind::Connect,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            OperationError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify the error for the retry loop.
    ///
    /// Depends only on the error and the configured status set, never on how
    /// many attempts have been made.
    pub fn classify(&self, config: &RetryConfig) -> ErrorClass {
        match self {
            OperationError::Transport { .. } => ErrorClass::Retryable,
            OperationError::Http { status, .. } if config.retryable_statuses.contains(status) => {
                ErrorClass::Retryable
            }
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self, config: &RetryConfig) -> bool {
        self.classify(config) == ErrorClass::Retryable
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::TimedOut => TransportKind::Timeout,
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                TransportKind::Connect
            }
            _ => TransportKind::Other,
        };
        OperationError::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    /// A single call failed terminally
    #[error("operation failed: {0}")]
    Operation(#[from] OperationError),

    /// Some items of a finished batch failed
    #[error("batch completed with {failed} failures ({successful} succeeded, {failed} failed)")]
    BatchPartialFailure {
        successful: usize,
        failed: usize,
        failures: Vec<(usize, String)>,
    },

    /// A fail-fast batch was stopped by its first terminal failure
    #[error(
        "batch aborted at item {index}: {reason} ({successful} succeeded, {failed} failed, {skipped} not attempted)"
    )]
    BatchAborted {
        index: usize,
        reason: String,
        successful: usize,
        failed: usize,
        skipped: usize,
    },

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
