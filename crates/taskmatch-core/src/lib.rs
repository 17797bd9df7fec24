//! TaskMatch Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network transports
//! - HTTP clients
//! - Runtime specifics
//!
//! Offers, match sessions, active tasks and the channel event vocabulary all
//! live here so that both sides of the protocol share one definition.

pub mod error;
pub mod event;
pub mod geo;
pub mod ids;
pub mod offer;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::{CoreError, FailureCategory};
pub use event::{ClientEvent, ServerEvent};
pub use geo::GeoPoint;
pub use ids::{OfferId, TaskId, WorkerId};
pub use offer::{Money, OfferOutcome, TaskOffer, TaskSummary, Urgency};
pub use status::{ConnectionState, OfferState, Presence, SearchState, TaskStatus};
pub use task::{ActiveTask, TaskSnapshot, WorkerProfile};
