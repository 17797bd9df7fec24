//! Task offers presented to workers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{GeoPoint, OfferId, TaskId, WorkerId};

/// Default offer window in seconds.
pub const DEFAULT_OFFER_WINDOW_SECS: u64 = 30;

/// Longest offer window accepted from an alert or from configuration.
pub const MAX_OFFER_WINDOW_SECS: u64 = 600;

/// Whether `secs` is a usable offer window.
pub fn is_valid_window(secs: u64) -> bool {
    (1..=MAX_OFFER_WINDOW_SECS).contains(&secs)
}

/// How urgently the requester needs help.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

/// A monetary amount in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }
}

/// The task as described in a `task:alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub urgency: Urgency,

    /// Estimated payout.
    #[serde(default)]
    pub estimate: Option<Money>,

    /// Where the work happens.
    #[serde(default)]
    pub location: Option<GeoPoint>,

    /// Offer window override sent by the server.
    #[serde(default)]
    pub offer_window_secs: Option<u64>,
}

impl TaskSummary {
    /// Create a summary with only an id (useful for testing).
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            category: String::new(),
            description: String::new(),
            urgency: Urgency::Normal,
            estimate: None,
            location: None,
            offer_window_secs: None,
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_window_secs(mut self, secs: u64) -> Self {
        self.offer_window_secs = Some(secs);
        self
    }
}

/// A time-boxed proposal of one task to one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOffer {
    pub id: OfferId,
    pub task: TaskSummary,
    pub worker_id: WorkerId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskOffer {
    /// Create an offer that expires `window_secs` from now.
    ///
    /// A window carried by the alert itself wins over `window_secs` when it
    /// lies within `1..=MAX_OFFER_WINDOW_SECS`. The result never exceeds
    /// `MAX_OFFER_WINDOW_SECS`.
    pub fn new(task: TaskSummary, worker_id: WorkerId, window_secs: u64) -> Self {
        let window = task
            .offer_window_secs
            .filter(|w| is_valid_window(*w))
            .unwrap_or(window_secs)
            .min(MAX_OFFER_WINDOW_SECS);
        let created_at = Utc::now();
        Self {
            id: OfferId::generate(),
            expires_at: created_at + Duration::seconds(window as i64),
            created_at,
            task,
            worker_id,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn urgency(&self) -> Urgency {
        self.task.urgency
    }

    pub fn estimate(&self) -> Option<&Money> {
        self.task.estimate.as_ref()
    }

    /// Length of the offer window.
    pub fn window(&self) -> std::time::Duration {
        (self.expires_at - self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Time left at `now`, saturating at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

/// How an offer ended, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Accepted,
    Declined,
    Expired,
    Cancelled,
    /// The server refused the accept or the task went elsewhere.
    NoLongerAvailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_window_default_and_override() {
        let offer = TaskOffer::new(TaskSummary::new("t1"), WorkerId::new("w1"), 30);
        assert_eq!(offer.window().as_secs(), 30);

        let offer = TaskOffer::new(
            TaskSummary::new("t1").with_window_secs(45),
            WorkerId::new("w1"),
            30,
        );
        assert_eq!(offer.window().as_secs(), 45);
    }

    #[test]
    fn test_out_of_range_window_falls_back() {
        let offer = TaskOffer::new(
            TaskSummary::new("t1").with_window_secs(u64::MAX),
            WorkerId::new("w1"),
            30,
        );
        assert_eq!(offer.window().as_secs(), 30);

        let offer = TaskOffer::new(
            TaskSummary::new("t1").with_window_secs(0),
            WorkerId::new("w1"),
            30,
        );
        assert_eq!(offer.window().as_secs(), 30);

        let offer = TaskOffer::new(TaskSummary::new("t1"), WorkerId::new("w1"), u64::MAX);
        assert_eq!(offer.window().as_secs(), MAX_OFFER_WINDOW_SECS);
    }

    #[test]
    fn test_remaining_saturates() {
        let offer = TaskOffer::new(TaskSummary::new("t1"), WorkerId::new("w1"), 30);
        let later = offer.expires_at + Duration::seconds(5);
        assert_eq!(offer.remaining(later), std::time::Duration::ZERO);
    }

    #[test]
    fn test_summary_from_alert_json() {
        let json = serde_json::json!({
            "id": "t9",
            "category": "plumbing",
            "urgency": "high",
            "estimate": { "amountMinor": 4500, "currency": "USD" },
            "location": { "lat": 40.7, "lng": -74.0 }
        });
        let summary: TaskSummary = serde_json::from_value(json).unwrap();
        assert_eq!(summary.id.as_str(), "t9");
        assert_eq!(summary.urgency, Urgency::High);
        assert_eq!(summary.estimate, Some(Money::new(4500, "USD")));
        assert!(summary.offer_window_secs.is_none());
    }
}
