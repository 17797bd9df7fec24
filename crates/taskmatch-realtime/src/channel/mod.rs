//! Duplex real-time channel.
//!
//! The [`ChannelManager`] owns the connection: authentication, heartbeat,
//! reconnect with backoff, and topic resubscription. Components talk to it
//! only through its API and never touch the transport.

pub mod frame;
pub mod manager;
pub mod memory;
pub mod transport;
pub mod websocket;

pub use frame::Frame;
pub use manager::{ChannelManager, HandlerId, Reconnects};
pub use memory::{MemoryPeer, MemoryTransport};
pub use transport::{Credential, Link, Transport};
pub use websocket::WebSocketTransport;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use taskmatch_core::ServerEvent;

/// Register handlers that parse `events` and forward them into a queue.
///
/// `wrap` picks the events a component cares about. Malformed payloads are
/// logged and dropped at this boundary.
pub(crate) fn forward_events<T, F>(
    channel: &ChannelManager,
    events: &[&'static str],
    tx: mpsc::UnboundedSender<T>,
    wrap: F,
) -> Vec<HandlerId>
where
    T: Send + 'static,
    F: Fn(ServerEvent) -> Option<T> + Send + Sync + Clone + 'static,
{
    events
        .iter()
        .map(|&name| {
            let tx = tx.clone();
            let wrap = wrap.clone();
            channel.on(name, move |payload: Value| {
                match ServerEvent::parse(name, payload) {
                    Ok(event) => {
                        if let Some(input) = wrap(event) {
                            let _ = tx.send(input);
                        }
                    }
                    Err(e) => warn!(event = name, error = %e, "Dropping malformed event"),
                }
            })
        })
        .collect()
}
