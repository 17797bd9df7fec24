//! Error types for the real-time layer.

use thiserror::Error;

use taskmatch_core::CoreError;

/// Failures inside the Channel Manager.
///
/// These never escape `send` or the heartbeat; they are logged and turned into
/// connection-state changes.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open channel: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    Closed,
}

/// Errors returned by component handles and sessions.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The local state does not allow the requested action.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Reconnection gave up; channel-dependent actions are disabled.
    #[error("channel is offline")]
    Offline,

    /// The component has been torn down.
    #[error("{0} has stopped")]
    Stopped(&'static str),

    /// The device position could not be read.
    #[error("location unavailable: {0}")]
    Location(String),
}
