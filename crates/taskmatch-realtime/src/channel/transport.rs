//! Transport seam for the Channel Manager.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::frame::Frame;
use crate::error::ChannelError;

/// Bearer credential presented when the channel opens.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// An open duplex connection.
///
/// The connection is considered lost once `inbound` yields `None` or a send
/// on `outbound` fails.
pub struct Link {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens authenticated duplex connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, credential: &Credential) -> Result<Link, ChannelError>;
}
