//! Real-time coordination for TaskMatch.
//!
//! This crate connects workers and requesters to the dispatch server over a
//! duplex channel:
//! - [`channel`]: connection lifecycle, heartbeat, reconnect, subscriptions
//! - [`offer`]: worker offers with countdown, requester search
//! - [`tracker`]: matched task from assignment to completion
//! - [`presence`] and [`location`]: worker availability and position reports
//! - [`session`]: per-actor wiring of the above

pub mod channel;
pub mod config;
pub mod error;
pub mod location;
pub mod offer;
pub mod optimistic;
pub mod presence;
pub mod session;
pub mod timer;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use channel::{ChannelManager, Credential, MemoryTransport, Transport, WebSocketTransport};
pub use config::{InvalidConfig, RealtimeConfig};
pub use error::{ChannelError, RealtimeError};
pub use location::{LocationReporter, LocationSource, StaticLocationSource};
pub use offer::{MatchHandle, MatchSession, OfferCoordinator, OfferEvent, OfferHandle, SearchEvent};
pub use presence::{LocationGate, PresenceController};
pub use session::{RequesterSession, SessionEvent, WorkerSession};
pub use tracker::{ActiveTaskTracker, TrackerEvent, TrackerHandle, TrackerRole};
