use harbor_bus::BusError;
use harbor_proto::{ClientId, CodecError};
use thiserror::Error;

use crate::link::LinkError;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("relay has not assigned an identity yet")]
    NoIdentity,
    #[error("refusing to negotiate with own identity {0}")]
    SelfNegotiation(ClientId),
    #[error("a session with {0} is already active")]
    SessionActive(ClientId),
    #[error("negotiation with {0} was aborted")]
    NegotiationAborted(ClientId),
    #[error("no open direct channel to {0}")]
    ChannelNotReady(ClientId),
    #[error("relay connection is not open")]
    RelayNotConnected,
    #[error("relay connection failed: {0}")]
    Relay(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type PeerResult<T> = Result<T, PeerError>;
