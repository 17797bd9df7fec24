//! Real-time channel events and their payloads.
//!
//! Events travel as a name plus a JSON payload. Inbound events are parsed into
//! [`ServerEvent`]; outbound events are built as [`ClientEvent`] and split into
//! name and payload before they reach the channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, GeoPoint, TaskId, TaskStatus, TaskSummary, WorkerId, WorkerProfile};

/// Event names used on the channel.
pub mod names {
    pub const TASK_ALERT: &str = "task:alert";
    pub const TASK_CANCELLED: &str = "task:cancelled";
    pub const TASK_ASSIGNED: &str = "task:assigned";
    pub const TASK_MATCH_FAILED: &str = "task:match_failed";
    pub const TASK_STATUS_UPDATE: &str = "task:status_update";
    pub const HELPER_LOCATION: &str = "helper:location";

    pub const TASK_ACCEPT: &str = "task:accept";
    pub const TASK_DECLINE: &str = "task:decline";
    pub const TASK_ARRIVED: &str = "task:arrived";
    pub const TASK_START: &str = "task:start";
    pub const TASK_COMPLETE: &str = "task:complete";
    pub const LOCATION_UPDATE: &str = "location:update";
    pub const ONLINE_STATUS: &str = "online:status";
    pub const HELPER_HEARTBEAT: &str = "helper:heartbeat";
}

/// `task:alert` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAlert {
    pub task: TaskSummary,
}

/// `task:cancelled` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelled {
    pub task_id: TaskId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `task:assigned` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssigned {
    pub worker: WorkerProfile,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// `task:match_failed` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFailed {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `task:status_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// `helper:location` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelperLocation {
    pub helper_id: WorkerId,
    pub location: GeoPoint,
    /// Seconds until arrival, when the server computed a route.
    #[serde(default)]
    pub eta: Option<u64>,
    /// Remaining route distance in metres.
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "task:alert")]
    TaskAlert(TaskAlert),
    #[serde(rename = "task:cancelled")]
    TaskCancelled(TaskCancelled),
    #[serde(rename = "task:assigned")]
    TaskAssigned(TaskAssigned),
    #[serde(rename = "task:match_failed")]
    MatchFailed(MatchFailed),
    #[serde(rename = "task:status_update")]
    StatusUpdate(StatusUpdate),
    #[serde(rename = "helper:location")]
    HelperLocation(HelperLocation),
}

impl ServerEvent {
    /// Parse an inbound event from its name and payload.
    pub fn parse(event: &str, payload: Value) -> Result<Self, CoreError> {
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let tagged = serde_json::json!({ "event": event, "payload": payload });
        serde_json::from_value(tagged).map_err(|e| CoreError::InvalidPayload {
            event: event.to_string(),
            reason: e.to_string(),
        })
    }

    /// Task this event refers to, when the payload names one.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskAlert(alert) => Some(&alert.task.id),
            Self::TaskCancelled(c) => Some(&c.task_id),
            Self::TaskAssigned(a) => a.task_id.as_ref(),
            Self::MatchFailed(f) => f.task_id.as_ref(),
            Self::StatusUpdate(u) => Some(&u.task_id),
            Self::HelperLocation(l) => l.task_id.as_ref(),
        }
    }
}

/// Events sent by this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "task:accept")]
    Accept { task_id: TaskId },

    #[serde(rename = "task:decline")]
    Decline { task_id: TaskId, reason: String },

    #[serde(rename = "task:arrived")]
    Arrived { task_id: TaskId },

    #[serde(rename = "task:start")]
    Start { task_id: TaskId },

    #[serde(rename = "task:complete")]
    Complete { task_id: TaskId, otp: String },

    #[serde(rename = "location:update")]
    LocationUpdate { coords: GeoPoint, timestamp: i64 },

    #[serde(rename = "online:status")]
    OnlineStatus { is_online: bool },

    #[serde(rename = "helper:heartbeat")]
    Heartbeat { timestamp: i64 },
}

impl ClientEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accept { .. } => names::TASK_ACCEPT,
            Self::Decline { .. } => names::TASK_DECLINE,
            Self::Arrived { .. } => names::TASK_ARRIVED,
            Self::Start { .. } => names::TASK_START,
            Self::Complete { .. } => names::TASK_COMPLETE,
            Self::LocationUpdate { .. } => names::LOCATION_UPDATE,
            Self::OnlineStatus { .. } => names::ONLINE_STATUS,
            Self::Heartbeat { .. } => names::HELPER_HEARTBEAT,
        }
    }

    /// Heartbeat stamped with the current time.
    pub fn heartbeat() -> Self {
        Self::Heartbeat {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Location update stamped with the current time.
    pub fn location(coords: GeoPoint) -> Self {
        Self::LocationUpdate {
            coords,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// JSON payload without the event name.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}
