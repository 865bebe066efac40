use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::ClientId;

/// Topic the relay uses to announce the current roster.
pub const CLIENTS_UPDATE_TOPIC: &str = "clientsUpdate";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope must be a json object")]
    NotAnObject,
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Negotiation step carried by a [`SignalEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalAction {
    Offer,
    Answer,
    Candidate,
    ClientId,
}

/// The `isSignal` key. Encodes as `true`; decodes `true` or `1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalMarker;

impl Serialize for SignalMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for SignalMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(true) => Ok(SignalMarker),
            Value::Number(n) if n.as_u64() == Some(1) => Ok(SignalMarker),
            other => Err(D::Error::custom(format!("invalid isSignal marker: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub is_signal: SignalMarker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ClientId>,
    pub action: SignalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Only set on `clientId` envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ClientId>,
}

impl SignalEnvelope {
    /// Identity assignment sent by the relay right after accepting a connection.
    pub fn client_id(id: ClientId) -> Self {
        Self {
            is_signal: SignalMarker,
            from: None,
            to: None,
            action: SignalAction::ClientId,
            data: None,
            id: Some(id),
        }
    }

    pub fn negotiation(action: SignalAction, from: ClientId, to: ClientId, data: Value) -> Self {
        Self {
            is_signal: SignalMarker,
            from: Some(from),
            to: Some(to),
            action,
            data: Some(data),
            id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEnvelope {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ClientId>,
}

impl AppEnvelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            to: None,
        }
    }

    pub fn addressed_to(mut self, to: Option<ClientId>) -> Self {
        self.to = to;
        self
    }

    /// Roster announcement: `{topic: "clientsUpdate", payload: [{id}, ...]}`.
    pub fn roster(ids: &[ClientId]) -> Self {
        let entries: Vec<RosterEntry> = ids.iter().map(|&id| RosterEntry { id }).collect();
        Self::new(
            CLIENTS_UPDATE_TOPIC,
            serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new())),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ClientId,
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Signal(SignalEnvelope),
    App(AppEnvelope),
}

impl Envelope {
    pub fn decode(text: &str) -> CodecResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> CodecResult<Self> {
        let is_signal = match &value {
            Value::Object(map) => map.contains_key("isSignal"),
            _ => return Err(CodecError::NotAnObject),
        };
        if is_signal {
            Ok(Envelope::Signal(serde_json::from_value(value)?))
        } else {
            Ok(Envelope::App(serde_json::from_value(value)?))
        }
    }

    pub fn encode(&self) -> CodecResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(D::Error::custom)
    }
}

impl From<SignalEnvelope> for Envelope {
    fn from(envelope: SignalEnvelope) -> Self {
        Envelope::Signal(envelope)
    }
}

impl From<AppEnvelope> for Envelope {
    fn from(envelope: AppEnvelope) -> Self {
        Envelope::App(envelope)
    }
}

/// Where the relay should deliver a frame, judged from its `to` key alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Broadcast,
    Unicast(ClientId),
    /// `to` is set but can never name a client; the frame is dropped.
    Unresolvable,
}

impl Recipient {
    /// Absent, `null`, `0`, `false` and `""` all mean "no recipient".
    pub fn of(frame: &Value) -> Self {
        match frame.get("to") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Recipient::Broadcast,
            Some(Value::String(s)) if s.is_empty() => Recipient::Broadcast,
            Some(Value::Number(n)) if n.as_u64() == Some(0) || n.as_f64() == Some(0.0) => {
                Recipient::Broadcast
            }
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(ClientId::new)
                .map(Recipient::Unicast)
                .unwrap_or(Recipient::Unresolvable),
            Some(_) => Recipient::Unresolvable,
        }
    }
}
