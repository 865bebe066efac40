//! Public endpoint API.
//!
//! An [`Endpoint`] owns one relay connection, one [`Negotiator`] and one
//! [`EventBus`]. Application code subscribes with [`Endpoint::on`], talks to
//! everyone through the relay with [`Endpoint::emit_event`], and streams to
//! a single peer over the direct channel with [`Endpoint::stream_event`]
//! once [`Endpoint::connect_dc`] has negotiated it.

use harbor_bus::{ensure_publishable, is_reserved, Delivery, EventBus, WS_CLOSED, WS_ERROR, WS_OPEN};
use harbor_proto::{AppEnvelope, ClientId, Envelope};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::error::{PeerError, PeerResult};
use crate::link::{LinkEvent, PeerConnector};
use crate::negotiation::{Negotiator, SessionState};
use crate::relay::{RelayConnection, RelayEvent, RelaySender};
use crate::rtc::RtcConnector;

pub struct Endpoint {
    config: PeerConfig,
    bus: EventBus,
    relay: RelaySender,
    negotiator: Arc<Negotiator>,
    link_events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    /// Lives as long as the endpoint, across relay reconnects.
    link_pump: Mutex<Option<JoinHandle<()>>>,
    /// Relay socket and relay pump; replaced on every attach.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    /// Endpoint that negotiates WebRTC data channels.
    pub fn new(config: PeerConfig) -> Self {
        let connector = Arc::new(RtcConnector::new(&config));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: PeerConfig, connector: Arc<dyn PeerConnector>) -> Self {
        let bus = EventBus::new();
        let relay = RelaySender::detached();
        let (negotiator, link_events) = Negotiator::new(connector, relay.clone(), bus.clone());
        Self {
            config,
            bus,
            relay,
            negotiator: Arc::new(negotiator),
            link_events: Mutex::new(Some(link_events)),
            link_pump: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribes to `topic`. Later subscribers run first.
    pub fn on<F>(&self, topic: impl Into<String>, callback: F)
    where
        F: Fn(&Delivery) + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, callback);
    }

    /// Opens the relay socket at the configured signaling URL.
    pub async fn connect(&self) -> PeerResult<()> {
        if self.relay.is_attached() {
            return Err(PeerError::Relay("already connected".into()));
        }
        let (connection, inbound) = match RelayConnection::connect(&self.config.signaling_url).await {
            Ok(opened) => opened,
            Err(err) => {
                self.bus
                    .emit_local(WS_ERROR, json!({"message": err.to_string()}));
                return Err(err);
            }
        };
        info!(url = %self.config.signaling_url, "connected to relay");
        self.attach_relay(connection.outbound(), inbound);
        self.tasks.lock().push(connection.into_task());
        Ok(())
    }

    /// Wires an already open relay transport: `outbound` takes encoded
    /// frames, `inbound` reports what the relay sends back.
    pub fn attach_relay(
        &self,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        self.relay.attach(outbound);
        self.bus.emit_local(WS_OPEN, Value::Null);

        if let Some(link_events) = self.link_events.lock().take() {
            *self.link_pump.lock() = Some(tokio::spawn(
                self.negotiator.clone().run_link_events(link_events),
            ));
        }
        self.tasks.lock().push(tokio::spawn(pump_relay(
            self.negotiator.clone(),
            self.bus.clone(),
            self.relay.clone(),
            inbound,
        )));
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_attached()
    }

    /// Identity assigned by the relay, if any yet.
    pub fn client_id(&self) -> Option<ClientId> {
        self.negotiator.self_id()
    }

    pub async fn wait_client_id(&self) -> PeerResult<ClientId> {
        let mut rx = self.negotiator.watch_self_id();
        let id = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PeerError::RelayNotConnected)?;
        id.ok_or(PeerError::NoIdentity)
    }

    /// Starts negotiating a direct channel with `peer`. Completion is
    /// reported through the `dcOpen` topic.
    pub async fn connect_dc(&self, peer: ClientId) -> PeerResult<()> {
        self.negotiator.initiate(peer).await
    }

    pub fn session_state(&self, peer: ClientId) -> Option<SessionState> {
        self.negotiator.state(peer)
    }

    pub fn direct_peers(&self) -> Vec<ClientId> {
        self.negotiator.active_peers()
    }

    /// Publishes through the relay; `to = None` broadcasts to every
    /// connected endpoint, this one included.
    pub fn emit_event(
        &self,
        topic: impl Into<String>,
        payload: Value,
        to: Option<ClientId>,
    ) -> PeerResult<()> {
        let envelope = AppEnvelope::new(topic, payload).addressed_to(to);
        ensure_publishable(&envelope.topic)?;
        self.relay.send(envelope)
    }

    /// Publishes over the direct channel to `peer`.
    pub async fn stream_event(
        &self,
        peer: ClientId,
        topic: impl Into<String>,
        payload: Value,
    ) -> PeerResult<()> {
        self.negotiator.publish_direct(peer, topic, payload).await
    }

    /// Sends a pre-built envelope through the relay as is.
    pub fn send_ws(&self, envelope: impl Into<Envelope>) -> PeerResult<()> {
        let envelope = envelope.into();
        if let Envelope::App(app) = &envelope {
            ensure_publishable(&app.topic)?;
        }
        self.relay.send(envelope)
    }

    /// Sends a pre-built envelope over the direct channel to `peer`.
    pub async fn send_dc(&self, peer: ClientId, envelope: AppEnvelope) -> PeerResult<()> {
        self.negotiator.send_direct(peer, envelope).await
    }

    pub async fn close_dc(&self, peer: ClientId) {
        self.negotiator.close(peer).await;
    }

    /// Closes every direct channel and the relay socket. `dcClosed` and
    /// `wsClosed` are published before this returns; the endpoint can
    /// connect again afterwards.
    pub async fn close(&self) {
        let was_attached = self.relay.is_attached();
        self.negotiator.close_all().await;
        self.relay.detach();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if was_attached {
            info!("relay connection closed");
            self.bus.emit_local(WS_CLOSED, Value::Null);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(pump) = self.link_pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump_relay(
    negotiator: Arc<Negotiator>,
    bus: EventBus,
    relay: RelaySender,
    mut inbound: mpsc::UnboundedReceiver<RelayEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            RelayEvent::Frame(text) => match Envelope::decode(&text) {
                Ok(Envelope::Signal(signal)) => negotiator.handle_signal(signal).await,
                Ok(Envelope::App(app)) => {
                    if is_reserved(&app.topic) {
                        warn!(topic = %app.topic, "dropping relay frame on reserved topic");
                        continue;
                    }
                    let delivered = bus.dispatch(&Delivery::relay(app.topic, app.payload));
                    debug!(delivered, "relay frame dispatched");
                }
                Err(err) => warn!(error = %err, "undecodable relay frame"),
            },
            RelayEvent::Error(message) => {
                bus.emit_local(WS_ERROR, json!({ "message": message }));
            }
            RelayEvent::Closed => {
                relay.detach();
                info!("relay connection closed");
                bus.emit_local(WS_CLOSED, Value::Null);
                break;
            }
        }
    }
}
