//! Offer coordination.
//!
//! Two views of the same matching process: the worker sees individual offers
//! ([`OfferCoordinator`]), the requester sees a search ([`MatchSession`]).

pub mod coordinator;
pub mod search;

pub use coordinator::{OfferCoordinator, OfferEvent, OfferHandle, OfferSnapshot};
pub use search::{MatchHandle, MatchSession, SearchEvent, SearchSnapshot};
