//! Wire frames exchanged over the duplex channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskmatch_core::ClientEvent;

use crate::error::ChannelError;

/// One JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            event: event.into(),
            payload,
        }
    }

    /// Event name, if this is an event frame.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { event, .. } => Some(event),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

impl From<&ClientEvent> for Frame {
    fn from(event: &ClientEvent) -> Self {
        Self::event(event.name(), event.payload())
    }
}
