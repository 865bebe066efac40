//! Seam between the negotiator and the peer-to-peer primitive.
//!
//! A [`PeerConnector`] opens one [`PeerLink`] per negotiation attempt. The
//! link produces and applies session descriptions, applies remote
//! candidates, and carries text frames once its channel is open. Everything
//! it discovers asynchronously is reported as a [`LinkEvent`].

use async_trait::async_trait;
use harbor_proto::ClientId;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("negotiation primitive failed: {0}")]
    Primitive(String),
    #[error("invalid negotiation payload: {0}")]
    InvalidPayload(String),
    #[error("channel is not open")]
    NotOpen,
}

/// Names one negotiation attempt with a peer. The generation changes every
/// time a session with that peer is recreated, so events from a replaced
/// link can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub peer: ClientId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEventKind {
    /// A local network candidate was discovered and should be trickled to the peer.
    LocalCandidate(Value),
    /// The channel is ready for traffic.
    Open,
    /// A text frame arrived on the channel.
    Message(String),
    /// The channel or its underlying connection went away.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkEvent {
    pub link: LinkId,
    pub kind: LinkEventKind,
}

impl LinkEvent {
    pub fn new(link: LinkId, kind: LinkEventKind) -> Self {
        Self { link, kind }
    }
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opens a local channel endpoint for `link`. Events for it go to `events`.
    async fn open(&self, link: LinkId, events: LinkEvents) -> Result<Arc<dyn PeerLink>, LinkError>;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<Value, LinkError>;

    async fn create_answer(&self) -> Result<Value, LinkError>;

    async fn set_local_description(&self, description: Value) -> Result<(), LinkError>;

    async fn set_remote_description(&self, description: Value) -> Result<(), LinkError>;

    async fn add_candidate(&self, candidate: Value) -> Result<(), LinkError>;

    fn is_open(&self) -> bool;

    async fn send(&self, frame: String) -> Result<(), LinkError>;

    /// Tears the link down. Safe to call more than once.
    async fn close(&self);
}
