//! Wire types shared by the relay and its endpoints.
//!
//! Every frame on either transport is a JSON [`Envelope`]: a signaling envelope
//! (negotiation traffic and identity assignment) or an application envelope
//! (topic pub/sub traffic). The two are told apart only by the `isSignal` key.

mod envelope;
mod identity;

pub use envelope::{
    AppEnvelope, CodecError, CodecResult, Envelope, Recipient, RosterEntry, SignalAction,
    SignalEnvelope, SignalMarker, CLIENTS_UPDATE_TOPIC,
};
pub use identity::{ClientId, ParseClientIdError};
