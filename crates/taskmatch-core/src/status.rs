//! Status enums for offers, match sessions, active tasks, and connectivity.

use serde::{Deserialize, Serialize};

/// State of the worker-side offer machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    /// Not participating in dispatch (offline or torn down).
    #[default]
    Idle,
    /// Available and waiting for an alert.
    Searching,
    /// An alert is live and its countdown is running.
    Offered,
    /// The worker took the task.
    Accepted,
    /// The worker declined the task.
    Declined,
    /// The countdown ran out, or the alert was dismissed.
    Expired,
    /// The task went away (requester cancelled, or taken elsewhere).
    Cancelled,
}

impl OfferState {
    /// Returns true if this offer has been resolved one way or another.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Accepted | Self::Declined | Self::Expired | Self::Cancelled
        )
    }

    /// Returns true while an offer occupies the worker.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Offered)
    }
}

/// State of a requester-side match session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    #[default]
    Idle,
    Searching,
    Matched,
    Failed,
    Cancelled,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Matched | Self::Failed | Self::Cancelled)
    }
}

/// Status of a task once a worker has been matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Matched, worker not yet on the way.
    #[default]
    Assigned,
    /// Worker is travelling to the task location.
    WorkerArriving,
    /// Worker is at the task location.
    WorkerArrived,
    /// Work has started.
    InProgress,
    /// Work confirmed complete with the one-time code.
    Completed,
    /// Task cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the task has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns true if the task is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Progress rank along the happy path.
    ///
    /// Terminal states share the highest rank so nothing supersedes them.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Assigned => 0,
            Self::WorkerArriving => 1,
            Self::WorkerArrived => 2,
            Self::InProgress => 3,
            Self::Completed | Self::Cancelled => 4,
        }
    }

    /// Returns true if moving to `next` is a forward step.
    pub fn precedes(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Cancelled || next.rank() > self.rank()
    }

    /// Wire name, as used in `task:status_update`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::WorkerArriving => "worker_arriving",
            Self::WorkerArrived => "worker_arrived",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Connectivity of the real-time channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    #[default]
    Disconnected,
    /// Opening a connection. `attempt` is 0 for the first open and counts
    /// reconnection attempts after an unexpected closure.
    Connecting { attempt: u32 },
    /// Open, authenticated, and subscriptions restored.
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true while recovering from an unexpected closure.
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Connecting { attempt } if *attempt > 0)
    }
}

/// Worker availability toggle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Offline,
    Online,
}

impl Presence {
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_progress() {
        assert!(TaskStatus::Assigned.precedes(TaskStatus::WorkerArriving));
        assert!(TaskStatus::WorkerArriving.precedes(TaskStatus::InProgress));
        assert!(!TaskStatus::InProgress.precedes(TaskStatus::WorkerArrived));
        assert!(!TaskStatus::InProgress.precedes(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.precedes(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.precedes(TaskStatus::Cancelled));
        assert!(!TaskStatus::Cancelled.precedes(TaskStatus::Completed));
    }

    #[test]
    fn test_task_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::WorkerArriving).unwrap();
        assert_eq!(json, "\"worker_arriving\"");
        let parsed: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
        assert_eq!(parsed.as_str(), "in_progress");
    }

    #[test]
    fn test_offer_state_terminal() {
        assert!(!OfferState::Offered.is_terminal());
        assert!(OfferState::Offered.is_live());
        assert!(OfferState::Expired.is_terminal());
        assert!(OfferState::Accepted.is_terminal());
    }

    #[test]
    fn test_connection_state_reconnecting() {
        assert!(!ConnectionState::Connecting { attempt: 0 }.is_reconnecting());
        assert!(ConnectionState::Connecting { attempt: 2 }.is_reconnecting());
        assert!(ConnectionState::Connected.is_connected());
    }
}
