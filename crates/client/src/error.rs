//! Client error types.

use thiserror::Error;

use dietshop_core::InvalidTransition;

/// Errors reading or writing client-local storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage file is corrupt: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Errors from the client-side purchase flow.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The storefront answered with a non-success status.
    #[error("storefront returned {status}: {message}")]
    Status { status: u16, message: String },

    /// No signed-in session.
    #[error("not signed in")]
    Unauthorized,

    /// The read did not finish within its timeout.
    #[error("request timed out")]
    Timeout,

    #[error("no guest purchase session")]
    NoSession,

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("invalid storefront URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    /// Whether retrying the same call could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status >= 500,
            Self::Timeout => true,
            _ => false,
        }
    }
}
