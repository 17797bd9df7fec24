//! JSON output for streaming session events to stdout.

use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use taskmatch_realtime::SessionEvent;

/// Global flag to enable JSON output mode.
static JSON_MODE_ENABLED: AtomicBool = AtomicBool::new(false);

/// Enable JSON output mode.
pub fn enable_json_mode() {
    JSON_MODE_ENABLED.store(true, Ordering::SeqCst);
}

/// Check if JSON mode is enabled.
pub fn is_json_mode() -> bool {
    JSON_MODE_ENABLED.load(Ordering::SeqCst)
}

/// JSON event types that can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    Connection,
    Presence,
    Offer,
    Search,
    Task,
    CommandRejected,
    Error,
}

impl From<&SessionEvent> for JsonEventType {
    fn from(event: &SessionEvent) -> Self {
        match event {
            SessionEvent::Connection { .. } => Self::Connection,
            SessionEvent::Presence { .. } => Self::Presence,
            SessionEvent::Offer(_) => Self::Offer,
            SessionEvent::Search(_) => Self::Search,
            SessionEvent::Task(_) => Self::Task,
        }
    }
}

/// A JSON event to be output to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: JsonEventType, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Output this event as a JSON line to stdout.
    pub fn emit(&self) {
        if !is_json_mode() {
            return;
        }
        if let Ok(json) = serde_json::to_string(self) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

/// Emit a session event.
pub fn emit_session_event(event: &SessionEvent) {
    let data = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
    JsonEvent::new(JsonEventType::from(event), data).emit();
}

/// Emit a command_rejected event.
pub fn emit_command_rejected(command: &str, error: &str) {
    JsonEvent::new(
        JsonEventType::CommandRejected,
        serde_json::json!({
            "command": command,
            "error": error,
        }),
    )
    .emit();
}

/// Emit an error event.
pub fn emit_error(message: &str) {
    JsonEvent::new(
        JsonEventType::Error,
        serde_json::json!({
            "message": message,
        }),
    )
    .emit();
}
