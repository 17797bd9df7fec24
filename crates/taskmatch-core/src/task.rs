//! Matched-task types: worker profile, server snapshot, and live tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{GeoPoint, TaskId, TaskStatus, WorkerId};

/// The worker as shown to a requester after a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProfile {
    pub id: WorkerId,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub rating: Option<f32>,

    #[serde(default)]
    pub phone: Option<String>,
}

impl WorkerProfile {
    pub fn new(id: impl Into<WorkerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rating: None,
            phone: None,
        }
    }
}

/// Authoritative task view returned by `GET /tasks/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,

    /// `None` while the server is still searching for a worker.
    #[serde(default)]
    pub status: Option<TaskStatus>,

    #[serde(default)]
    pub worker: Option<WorkerProfile>,

    #[serde(default)]
    pub destination: Option<GeoPoint>,

    #[serde(default)]
    pub worker_location: Option<GeoPoint>,
}

impl TaskSnapshot {
    /// Returns true if the server has matched a worker.
    pub fn is_matched(&self) -> bool {
        self.worker.is_some() && self.status.is_some_and(|s| s != TaskStatus::Cancelled)
    }
}

/// A task after a worker is matched, through completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub task_id: TaskId,

    /// Status as displayed, including an optimistic local step.
    pub status: TaskStatus,

    /// Status confirmed by the server.
    pub confirmed_status: TaskStatus,

    pub worker: Option<WorkerProfile>,

    pub destination: Option<GeoPoint>,

    pub worker_location: Option<GeoPoint>,

    /// Estimated time of arrival in seconds.
    pub eta_secs: Option<u64>,

    /// Remaining distance in metres.
    pub distance_m: Option<f64>,

    pub updated_at: DateTime<Utc>,
}

impl ActiveTask {
    /// Create a freshly assigned task.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Assigned,
            confirmed_status: TaskStatus::Assigned,
            worker: None,
            destination: None,
            worker_location: None,
            eta_secs: None,
            distance_m: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_destination(mut self, destination: Option<GeoPoint>) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_worker(mut self, worker: Option<WorkerProfile>) -> Self {
        self.worker = worker;
        self
    }

    /// Check if the task is in a confirmed terminal state.
    pub fn is_terminal(&self) -> bool {
        self.confirmed_status.is_terminal()
    }

    /// Record a worker position and its derived route figures.
    pub fn record_location(
        &mut self,
        location: GeoPoint,
        eta_secs: Option<u64>,
        distance_m: Option<f64>,
    ) {
        self.worker_location = Some(location);
        self.eta_secs = eta_secs;
        self.distance_m = distance_m;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_matched() {
        let json = serde_json::json!({
            "id": "t1",
            "status": "assigned",
            "worker": { "id": "w1", "name": "Ana" }
        });
        let snapshot: TaskSnapshot = serde_json::from_value(json).unwrap();
        assert!(snapshot.is_matched());

        let searching: TaskSnapshot =
            serde_json::from_value(serde_json::json!({ "id": "t1" })).unwrap();
        assert!(!searching.is_matched());
    }

    #[test]
    fn test_active_task_record_location() {
        let mut task = ActiveTask::new(TaskId::new("t1"));
        assert!(!task.is_terminal());
        task.record_location(GeoPoint::new(1.0, 2.0), Some(120), Some(900.0));
        assert_eq!(task.eta_secs, Some(120));
        assert_eq!(task.worker_location, Some(GeoPoint::new(1.0, 2.0)));
    }
}
