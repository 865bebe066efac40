//! Topic-based publish/subscribe for endpoint code.
//!
//! The bus does not know about transports. Whoever receives a frame wraps it
//! in a [`Delivery`] that records where it came from and hands it to
//! [`EventBus::dispatch`]. Subscribers of a topic run most-recently-subscribed
//! first.

use harbor_proto::ClientId;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Identity assigned by the relay.
pub const CLIENT_ID: &str = "clientId";
/// Relay connection opened.
pub const WS_OPEN: &str = "wsOpen";
/// Relay connection closed.
pub const WS_CLOSED: &str = "wsClosed";
/// Relay connection failed.
pub const WS_ERROR: &str = "wsError";
/// Direct channel with a peer opened.
pub const DC_OPEN: &str = "dcOpen";
/// Direct channel with a peer closed.
pub const DC_CLOSED: &str = "dcClosed";

/// Topics published by the endpoint itself. Application code may subscribe
/// to them but never publish them.
pub const RESERVED_TOPICS: [&str; 6] = [CLIENT_ID, WS_OPEN, WS_CLOSED, WS_ERROR, DC_OPEN, DC_CLOSED];

pub fn is_reserved(topic: &str) -> bool {
    RESERVED_TOPICS.contains(&topic)
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic `{0}` is reserved for endpoint lifecycle events")]
    ReservedTopic(String),
    #[error("payload for `{topic}` does not match the requested type: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type BusResult<T> = Result<T, BusError>;

/// Rejects topics application code is not allowed to publish.
pub fn ensure_publishable(topic: &str) -> BusResult<()> {
    if is_reserved(topic) {
        Err(BusError::ReservedTopic(topic.to_string()))
    } else {
        Ok(())
    }
}

/// Where a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Raised by this endpoint (lifecycle events).
    Local,
    /// Arrived over the relay connection.
    Relay,
    /// Arrived over the direct channel with the given peer.
    Direct(ClientId),
}

/// One event handed to subscribers.
///
/// Subscribers only ever see it by shared reference, so the payload and its
/// provenance cannot be altered between subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    topic: String,
    origin: Origin,
    payload: Value,
}

impl Delivery {
    pub fn local(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, Origin::Local, payload)
    }

    pub fn relay(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, Origin::Relay, payload)
    }

    pub fn direct(sender: ClientId, topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, Origin::Direct(sender), payload)
    }

    fn new(topic: impl Into<String>, origin: Origin, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            origin,
            payload,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Sending peer, known only for frames that came over a direct channel.
    pub fn sender(&self) -> Option<ClientId> {
        match self.origin {
            Origin::Direct(sender) => Some(sender),
            Origin::Local | Origin::Relay => None,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> BusResult<T> {
        T::deserialize(&self.payload).map_err(|source| BusError::Decode {
            topic: self.topic.clone(),
            source,
        })
    }
}

pub type Subscriber = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Topic table shared by every clone of the bus.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `topic`. There is no way to remove it again.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F)
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        let mut guard = self.topics.write();
        guard
            .entry(topic.into())
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Invokes every subscriber of the delivery's topic, newest first, and
    /// returns how many ran.
    ///
    /// The table lock is released before any callback runs, so subscribers
    /// may subscribe further callbacks; those see the next delivery.
    pub fn dispatch(&self, delivery: &Delivery) -> usize {
        let subscribers: Vec<Subscriber> = match self.topics.read().get(delivery.topic()) {
            Some(list) => list.clone(),
            None => return 0,
        };
        trace!(
            topic = delivery.topic(),
            origin = ?delivery.origin(),
            subscribers = subscribers.len(),
            "dispatching"
        );
        for subscriber in subscribers.iter().rev() {
            subscriber(delivery);
        }
        subscribers.len()
    }

    /// Publishes an endpoint lifecycle event.
    pub fn emit_local(&self, topic: &str, payload: Value) -> usize {
        self.dispatch(&Delivery::local(topic, payload))
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.topics.read();
        let mut counts: Vec<(&String, usize)> =
            guard.iter().map(|(topic, subs)| (topic, subs.len())).collect();
        counts.sort();
        f.debug_struct("EventBus").field("topics", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test_timeout::timeout]
    fn newest_subscriber_runs_first() {
        let bus = EventBus::new();
        let calls = recorder();

        let log = calls.clone();
        bus.subscribe("t", move |_| log.lock().push("f1".into()));
        let log = calls.clone();
        bus.subscribe("t", move |_| log.lock().push("f2".into()));

        let invoked = bus.dispatch(&Delivery::relay("t", json!("P")));
        assert_eq!(invoked, 2);
        assert_eq!(*calls.lock(), vec!["f2".to_string(), "f1".to_string()]);
    }

    #[test_timeout::timeout]
    fn topics_are_isolated() {
        let bus = EventBus::new();
        let calls = recorder();
        let log = calls.clone();
        bus.subscribe("a", move |d| log.lock().push(d.topic().to_string()));

        assert_eq!(bus.dispatch(&Delivery::relay("b", Value::Null)), 0);
        assert_eq!(bus.dispatch(&Delivery::relay("a", Value::Null)), 1);
        assert_eq!(*calls.lock(), vec!["a".to_string()]);
    }

    #[test_timeout::timeout]
    fn direct_deliveries_carry_sender_outside_payload() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        bus.subscribe("pos", move |d| {
            *slot.lock() = Some((d.sender(), d.payload().clone()));
        });

        let sender = ClientId::new(9).unwrap();
        bus.dispatch(&Delivery::direct(sender, "pos", json!({"x": 1})));

        let (from, payload) = seen.lock().clone().expect("delivered");
        assert_eq!(from, Some(sender));
        assert_eq!(serde_json::to_string(&payload).unwrap(), r#"{"x":1}"#);
    }

    #[test_timeout::timeout]
    fn relay_deliveries_have_no_sender() {
        let delivery = Delivery::relay("chat", json!("hello"));
        assert_eq!(delivery.sender(), None);
        assert_eq!(delivery.origin(), Origin::Relay);
        assert_eq!(delivery.decode::<String>().unwrap(), "hello");
        assert!(matches!(
            delivery.decode::<u32>(),
            Err(BusError::Decode { .. })
        ));
    }

    #[test_timeout::timeout]
    fn subscribing_from_a_callback_does_not_deadlock() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe("t", move |_| inner.subscribe("t", |_| {}));

        assert_eq!(bus.dispatch(&Delivery::local("t", Value::Null)), 1);
        assert_eq!(bus.subscriber_count("t"), 2);
    }

    #[test_timeout::timeout]
    fn reserved_topics_cannot_be_published() {
        for topic in RESERVED_TOPICS {
            assert!(matches!(
                ensure_publishable(topic),
                Err(BusError::ReservedTopic(_))
            ));
        }
        assert!(ensure_publishable("clientsUpdate").is_ok());
        assert!(ensure_publishable("chat").is_ok());
    }
}
