//! Crate-wide error type.
//!
//! Every fallible operation in `strata` returns [`Result`]. The enum is
//! `Clone` so a finished background task can hand the same outcome to every
//! caller that waits on it.

use std::time::Duration;

/// Errors produced by history compression, streaming, and task coordination.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The chat completion provider failed.
    #[error("provider error{}: {message}", fmt_status(.status))]
    Provider {
        message: String,
        status: Option<u16>,
        /// Whether the failure is worth retrying (timeouts, 429, 5xx, network).
        transient: bool,
    },

    /// Waiting on a background task exceeded the deadline. The task itself
    /// keeps running.
    #[error("task did not complete within {0:?}")]
    Timeout(Duration),

    /// The task was killed or its worker was torn down before it finished.
    #[error("task was cancelled")]
    Cancelled,

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The worker pool already hosts its maximum number of named workers.
    #[error("worker pool exhausted ({max_workers} workers)")]
    PoolExhausted { max_workers: usize },

    /// The utility model failed to produce a summary.
    #[error("summarization failed: {0}")]
    Summarization(String),

    /// A persisted history document is structurally invalid.
    #[error("invalid history document: {0}")]
    Deserialize(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    /// Build a provider error, classifying transience from the HTTP status.
    pub fn provider(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Provider {
            message: message.into(),
            status,
            transient: status.is_some_and(is_transient_status),
        }
    }

    /// Build a provider error for a network-level failure (always transient).
    pub fn network(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            status: None,
            transient: true,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }

    /// Whether this is the timeout kind (as opposed to a task failure).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// HTTP statuses treated as transient: request timeout, rate limit, and
/// every 5xx.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || status >= 500
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::TaskPanicked(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
