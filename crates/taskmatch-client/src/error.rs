//! Error types for the REST client.

use taskmatch_core::FailureCategory;
use thiserror::Error;

/// Errors that can occur when calling the task or helper APIs.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network failure, timeout, or malformed response body.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credential missing, expired, or lacking permission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request lost a race (task already taken or resolved).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The task no longer exists in a state that accepts this request.
    #[error("gone: {0}")]
    Gone(String),

    /// The server refused the request as invalid (e.g. wrong one-time code).
    #[error("rejected: {message}")]
    Rejected { message: String },

    /// Any other non-success status.
    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Map an unsuccessful HTTP status onto an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            410 => Self::Gone(message),
            400 | 422 => Self::Rejected { message },
            _ => Self::Status { status, message },
        }
    }

    /// Failure category used by callers before touching local state.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Http(_) | Self::Status { .. } | Self::Serialization(_) => {
                FailureCategory::Transport
            }
            Self::Conflict(_) | Self::Gone(_) => FailureCategory::RaceLost,
            Self::Unauthorized(_) | Self::Rejected { .. } => FailureCategory::Validation,
            Self::NotFound(_) => FailureCategory::StaleState,
        }
    }
}
