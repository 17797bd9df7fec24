//! REST client library for TaskMatch.
//!
//! Provides the persistence-side collaborator traits consumed by the real-time
//! core and an HTTP implementation of them.

pub mod api;
pub mod error;
pub mod http;

pub use api::{HelperApi, TaskApi};
pub use error::ClientError;
pub use http::HttpClient;
