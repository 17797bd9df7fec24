//! Core domain errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core domain errors for TaskMatch.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not known locally or by the server.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A local action is still waiting for server confirmation.
    #[error("Action already pending: {0}")]
    ActionPending(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An inbound event payload did not match its schema.
    #[error("Invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidStateTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }
}

/// How a failure is handled before it is allowed to touch local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Disconnects and dropped sends; recovered by reconnect and resubscribe.
    Transport,
    /// Someone else resolved the task first; reported as "no longer available".
    RaceLost,
    /// Bad one-time code, permission denial; prior status is kept for retry.
    Validation,
    /// Local state refers to something the server does not know; local state is
    /// discarded and authoritative status re-fetched.
    StaleState,
}

impl FailureCategory {
    /// Returns true if the operation may be retried without user input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport)
    }
}
