//! Endpoint side of Harbor: relay connection, per-peer negotiation of direct
//! data channels, and the topic bus that sits on top of both transports.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod mock;
pub mod negotiation;
pub mod relay;
pub mod rtc;

pub use config::{PeerConfig, PeerConfigBuilder};
pub use endpoint::Endpoint;
pub use error::{PeerError, PeerResult};
pub use harbor_bus::{Delivery, EventBus, Origin};
pub use harbor_proto::{AppEnvelope, ClientId, Envelope};
pub use link::{LinkError, LinkEvent, LinkEventKind, LinkId, PeerConnector, PeerLink};
pub use negotiation::{Negotiator, SessionInfo, SessionState};
pub use relay::{RelayConnection, RelayEvent, RelaySender};
pub use rtc::{RtcConnector, RtcLink};
