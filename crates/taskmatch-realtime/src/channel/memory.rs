//! In-process transport.
//!
//! Each successful `open` hands a [`MemoryPeer`] to whoever holds the peer
//! receiver, which then plays the server. Dropping the peer closes the link.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::frame::Frame;
use super::transport::{Credential, Link, Transport};
use crate::error::ChannelError;

const LINK_CAPACITY: usize = 256;

/// Server side of an in-memory link.
pub struct MemoryPeer {
    pub credential: Credential,
    from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
}

impl MemoryPeer {
    /// Push a server event to the client. Returns false if the link is gone.
    pub async fn push(&self, event: &str, payload: Value) -> bool {
        self.to_client
            .send(Frame::event(event, payload))
            .await
            .is_ok()
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// All frames the client has sent so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Transport backed by tokio channels.
#[derive(Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures: Arc<AtomicU32>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            failures: Arc::new(AtomicU32::new(0)),
        };
        (transport, rx)
    }

    /// Make the next `n` opens fail.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<Link, ChannelError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChannelError::Connect("refused".to_string()));
        }

        let (client_tx, from_client) = mpsc::channel(LINK_CAPACITY);
        let (to_client, client_rx) = mpsc::channel(LINK_CAPACITY);
        let peer = MemoryPeer {
            credential: credential.clone(),
            from_client,
            to_client,
        };
        self.peers.send(peer).map_err(|_| ChannelError::Closed)?;

        Ok(Link {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}
