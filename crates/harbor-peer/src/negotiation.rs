//! Per-peer offer/answer/candidate state machine.
//!
//! Sessions are keyed by the remote identity, so one endpoint can negotiate
//! with several peers at once. Signaling always goes out through the relay,
//! for the whole life of a session; only application frames use the direct
//! channel once it is open.

use harbor_bus::{ensure_publishable, is_reserved, Delivery, EventBus, CLIENT_ID, DC_CLOSED, DC_OPEN};
use harbor_proto::{AppEnvelope, ClientId, Envelope, SignalAction, SignalEnvelope};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{PeerError, PeerResult};
use crate::link::{LinkError, LinkEvent, LinkEventKind, LinkEvents, LinkId, PeerConnector, PeerLink};
use crate::relay::RelaySender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    /// Offer sent, no answer yet.
    Offering,
    /// Answer applied, waiting for the channel to open.
    AwaitingAnswer,
    /// Answer sent, waiting for the channel to open.
    AnsweringOffer,
    Connected,
    Closed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        self != SessionState::Closed
    }
}

struct NegotiationSession {
    self_id: ClientId,
    generation: u64,
    state: SessionState,
    pending_local_description: Option<Value>,
    link: Option<Arc<dyn PeerLink>>,
    /// Local candidates found before the offer or answer went out.
    outgoing_candidates: Vec<Value>,
    description_sent: bool,
    /// Remote candidates that arrived before the remote description was applied.
    incoming_candidates: Vec<Value>,
    remote_applied: bool,
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub self_id: ClientId,
    pub other_id: ClientId,
    pub state: SessionState,
    pub pending_local_description: Option<Value>,
}

struct ReplacedSession {
    self_id: ClientId,
    link: Option<Arc<dyn PeerLink>>,
    was_connected: bool,
}

pub struct Negotiator {
    connector: Arc<dyn PeerConnector>,
    relay: RelaySender,
    bus: EventBus,
    events: LinkEvents,
    self_id: watch::Sender<Option<ClientId>>,
    sessions: Mutex<HashMap<ClientId, NegotiationSession>>,
    generations: AtomicU64,
}

impl Negotiator {
    /// Returns the negotiator and the queue its links report on. Feed that
    /// queue back through [`Negotiator::handle_link_event`], usually via
    /// [`Negotiator::run_link_events`].
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        relay: RelaySender,
        bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (self_id, _) = watch::channel(None);
        let negotiator = Self {
            connector,
            relay,
            bus,
            events,
            self_id,
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        };
        (negotiator, events_rx)
    }

    pub fn self_id(&self) -> Option<ClientId> {
        *self.self_id.borrow()
    }

    pub fn watch_self_id(&self) -> watch::Receiver<Option<ClientId>> {
        self.self_id.subscribe()
    }

    pub fn state(&self, peer: ClientId) -> Option<SessionState> {
        self.sessions.lock().get(&peer).map(|s| s.state)
    }

    pub fn session(&self, peer: ClientId) -> Option<SessionInfo> {
        self.sessions.lock().get(&peer).map(|s| SessionInfo {
            self_id: s.self_id,
            other_id: peer,
            state: s.state,
            pending_local_description: s.pending_local_description.clone(),
        })
    }

    /// Peers with a session that has not closed.
    pub fn active_peers(&self) -> Vec<ClientId> {
        let mut peers: Vec<ClientId> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.state.is_active())
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    /// Starts negotiating a direct channel with `other`.
    pub async fn initiate(&self, other: ClientId) -> PeerResult<()> {
        let self_id = self.self_id().ok_or(PeerError::NoIdentity)?;
        if other == self_id {
            return Err(PeerError::SelfNegotiation(other));
        }
        let (generation, _) = self.begin_session(self_id, other, false)?;
        let id = LinkId {
            peer: other,
            generation,
        };

        let offer = match self.prepare_offer(id).await {
            Ok(offer) => offer,
            Err(err) => {
                warn!(peer = %other, error = %err, "failed to prepare offer");
                self.abandon(id).await;
                return Err(err);
            }
        };

        if self.advance(id, SessionState::Idle, SessionState::Offering, Some(offer.clone()))?
            == SessionState::Closed
        {
            return Err(PeerError::NegotiationAborted(other));
        }

        if let Err(err) = self.send_description(id, SignalAction::Offer, offer) {
            self.abandon(id).await;
            return Err(err);
        }
        info!(peer = %other, "offer sent");
        Ok(())
    }

    /// Routes a signaling envelope that arrived over the relay.
    pub async fn handle_signal(&self, signal: SignalEnvelope) {
        if signal.action == SignalAction::ClientId {
            match signal.id {
                Some(id) => {
                    self.self_id.send_replace(Some(id));
                    info!(client_id = %id, "identity assigned");
                    self.bus.emit_local(CLIENT_ID, json!(id));
                }
                None => warn!("clientId signal without an id"),
            }
            return;
        }

        let (Some(from), Some(data)) = (signal.from, signal.data) else {
            warn!(action = ?signal.action, "dropping incomplete signal");
            return;
        };
        if let (Some(to), Some(me)) = (signal.to, self.self_id()) {
            if to != me {
                debug!(from = %from, to = %to, "signal addressed elsewhere");
                return;
            }
        }

        match signal.action {
            SignalAction::Offer => self.on_offer(from, data).await,
            SignalAction::Answer => self.on_answer(from, data).await,
            SignalAction::Candidate => self.on_remote_candidate(from, data).await,
            SignalAction::ClientId => {}
        }
    }

    /// Processes one event reported by a link.
    pub async fn handle_link_event(&self, event: LinkEvent) {
        let LinkEvent { link, kind } = event;
        match kind {
            LinkEventKind::LocalCandidate(candidate) => self.on_local_candidate(link, candidate),
            LinkEventKind::Open => self.on_channel_open(link),
            LinkEventKind::Message(text) => self.on_channel_message(link.peer, &text),
            LinkEventKind::Closed => self.on_channel_close(link).await,
        }
    }

    pub async fn run_link_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_link_event(event).await;
        }
    }

    /// Sends an application envelope over the direct channel to `peer`.
    pub async fn send_direct(&self, peer: ClientId, envelope: AppEnvelope) -> PeerResult<()> {
        ensure_publishable(&envelope.topic)?;
        let link = {
            let sessions = self.sessions.lock();
            match sessions.get(&peer) {
                Some(s) if s.state == SessionState::Connected => s.link.clone(),
                _ => None,
            }
        }
        .ok_or(PeerError::ChannelNotReady(peer))?;
        if !link.is_open() {
            return Err(PeerError::ChannelNotReady(peer));
        }

        let frame = Envelope::from(envelope).encode()?;
        link.send(frame).await.map_err(|err| match err {
            LinkError::NotOpen => PeerError::ChannelNotReady(peer),
            other => other.into(),
        })
    }

    pub async fn publish_direct(
        &self,
        peer: ClientId,
        topic: impl Into<String>,
        payload: Value,
    ) -> PeerResult<()> {
        self.send_direct(peer, AppEnvelope::new(topic, payload)).await
    }

    /// Closes the session with `peer` and publishes `dcClosed` for it before
    /// returning. The link's own close event is then ignored.
    pub async fn close(&self, peer: ClientId) {
        let ended = self.end_session(peer, None);
        self.finish_close(peer, ended).await;
    }

    pub async fn close_all(&self) {
        for peer in self.active_peers() {
            self.close(peer).await;
        }
    }

    async fn on_offer(&self, from: ClientId, description: Value) {
        let Some(self_id) = self.self_id() else {
            warn!(peer = %from, "offer arrived before identity assignment");
            return;
        };
        let (generation, replaced) = match self.begin_session(self_id, from, true) {
            Ok(started) => started,
            Err(err) => {
                warn!(peer = %from, error = %err, "cannot accept offer");
                return;
            }
        };
        if let Some(replaced) = replaced {
            info!(peer = %from, "fresh offer replaces active session");
            if let Some(link) = replaced.link {
                link.close().await;
            }
            if replaced.was_connected {
                self.bus.emit_local(
                    DC_CLOSED,
                    json!({"selfId": replaced.self_id, "otherId": from}),
                );
            }
        }

        let id = LinkId {
            peer: from,
            generation,
        };
        let answer = match self.prepare_answer(id, description).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(peer = %from, error = %err, "failed to answer offer");
                self.abandon(id).await;
                return;
            }
        };

        // The channel may already report open; that state wins over AnsweringOffer.
        match self.advance(id, SessionState::Idle, SessionState::AnsweringOffer, Some(answer.clone())) {
            Ok(SessionState::Closed) | Err(_) => {
                debug!(peer = %from, "session ended before the answer went out");
                return;
            }
            Ok(_) => {}
        }

        match self.send_description(id, SignalAction::Answer, answer) {
            Ok(()) => info!(peer = %from, "answer sent"),
            Err(err) => warn!(peer = %from, error = %err, "failed to send answer"),
        }
    }

    async fn on_answer(&self, from: ClientId, description: Value) {
        let (id, link) = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&from) {
                Some(s) if s.state == SessionState::Offering => match s.link.clone() {
                    Some(link) => {
                        s.state = SessionState::AwaitingAnswer;
                        (
                            LinkId {
                                peer: from,
                                generation: s.generation,
                            },
                            link,
                        )
                    }
                    None => return,
                },
                Some(s) => {
                    debug!(peer = %from, state = ?s.state, "ignoring stale answer");
                    return;
                }
                None => {
                    debug!(peer = %from, "ignoring answer without a session");
                    return;
                }
            }
        };

        match link.set_remote_description(description).await {
            Ok(()) => self.apply_held_candidates(id, &link).await,
            Err(err) => {
                warn!(peer = %from, error = %err, "failed to apply answer");
                self.abandon(id).await;
            }
        }
    }

    async fn on_remote_candidate(&self, from: ClientId, candidate: Value) {
        let link = {
            let mut sessions = self.sessions.lock();
            let Some(s) = sessions.get_mut(&from).filter(|s| s.state.is_active()) else {
                debug!(peer = %from, "ignoring candidate without an open session");
                return;
            };
            if !s.remote_applied {
                debug!(peer = %from, "holding candidate until the remote description is applied");
                s.incoming_candidates.push(candidate);
                return;
            }
            s.link.clone()
        };
        let Some(link) = link else {
            return;
        };
        // Late or duplicate candidates are expected with trickled ICE.
        if let Err(err) = link.add_candidate(candidate).await {
            debug!(peer = %from, error = %err, "candidate not applied");
        }
    }

    fn on_local_candidate(&self, id: LinkId, candidate: Value) {
        let self_id = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id.peer) {
                Some(s) if s.generation == id.generation && s.state.is_active() => {
                    if !s.description_sent {
                        s.outgoing_candidates.push(candidate);
                        return;
                    }
                    s.self_id
                }
                _ => {
                    debug!(peer = %id.peer, "dropping candidate from a replaced link");
                    return;
                }
            }
        };
        if let Err(err) = self.relay.send(SignalEnvelope::negotiation(
            SignalAction::Candidate,
            self_id,
            id.peer,
            candidate,
        )) {
            warn!(peer = %id.peer, error = %err, "failed to send candidate");
        }
    }

    fn on_channel_open(&self, id: LinkId) {
        let self_id = {
            let mut sessions = self.sessions.lock();
            let Some(s) = sessions
                .get_mut(&id.peer)
                .filter(|s| s.generation == id.generation)
            else {
                return;
            };
            match s.state {
                SessionState::Connected | SessionState::Closed => return,
                _ => {
                    s.state = SessionState::Connected;
                    s.self_id
                }
            }
        };
        info!(peer = %id.peer, "direct channel open");
        self.bus
            .emit_local(DC_OPEN, json!({"selfId": self_id, "otherId": id.peer}));
    }

    fn on_channel_message(&self, peer: ClientId, text: &str) {
        match Envelope::decode(text) {
            Ok(Envelope::App(app)) => {
                if is_reserved(&app.topic) {
                    warn!(peer = %peer, topic = %app.topic, "dropping frame on reserved topic");
                    return;
                }
                self.bus
                    .dispatch(&Delivery::direct(peer, app.topic, app.payload));
            }
            Ok(Envelope::Signal(_)) => {
                warn!(peer = %peer, "ignoring signaling frame on direct channel")
            }
            Err(err) => warn!(peer = %peer, error = %err, "undecodable direct frame"),
        }
    }

    async fn on_channel_close(&self, id: LinkId) {
        let ended = self.end_session(id.peer, Some(id.generation));
        self.finish_close(id.peer, ended).await;
    }

    async fn finish_close(&self, peer: ClientId, ended: Option<(ClientId, Option<Arc<dyn PeerLink>>)>) {
        let Some((self_id, link)) = ended else {
            return;
        };
        if let Some(link) = link {
            link.close().await;
        }
        info!(peer = %peer, "direct channel closed");
        self.bus
            .emit_local(DC_CLOSED, json!({"selfId": self_id, "otherId": peer}));
    }

    /// Marks the active session with `peer` closed, optionally only if it is
    /// still the given generation. Returns its identity and detached link.
    fn end_session(
        &self,
        peer: ClientId,
        generation: Option<u64>,
    ) -> Option<(ClientId, Option<Arc<dyn PeerLink>>)> {
        let mut sessions = self.sessions.lock();
        let s = sessions.get_mut(&peer).filter(|s| {
            s.state.is_active() && generation.map_or(true, |g| g == s.generation)
        })?;
        s.state = SessionState::Closed;
        s.pending_local_description = None;
        s.outgoing_candidates.clear();
        s.incoming_candidates.clear();
        Some((s.self_id, s.link.take()))
    }

    /// Sends the offer or answer, then the local candidates gathered while it
    /// was prepared. Both go out under the session lock, so no candidate can
    /// reach the relay ahead of its description.
    fn send_description(&self, id: LinkId, action: SignalAction, description: Value) -> PeerResult<()> {
        let mut sessions = self.sessions.lock();
        let s = sessions
            .get_mut(&id.peer)
            .filter(|s| s.generation == id.generation && s.state.is_active())
            .ok_or(PeerError::NegotiationAborted(id.peer))?;
        let self_id = s.self_id;
        self.relay
            .send(SignalEnvelope::negotiation(action, self_id, id.peer, description))?;
        s.description_sent = true;
        for candidate in s.outgoing_candidates.drain(..) {
            self.relay.send(SignalEnvelope::negotiation(
                SignalAction::Candidate,
                self_id,
                id.peer,
                candidate,
            ))?;
        }
        Ok(())
    }

    /// Applies remote candidates that were held back waiting for the remote
    /// description; later ones are applied as they arrive.
    async fn apply_held_candidates(&self, id: LinkId, link: &Arc<dyn PeerLink>) {
        let held = {
            let mut sessions = self.sessions.lock();
            match sessions
                .get_mut(&id.peer)
                .filter(|s| s.generation == id.generation && s.state.is_active())
            {
                Some(s) => {
                    s.remote_applied = true;
                    std::mem::take(&mut s.incoming_candidates)
                }
                None => Vec::new(),
            }
        };
        for candidate in held {
            if let Err(err) = link.add_candidate(candidate).await {
                debug!(peer = %id.peer, error = %err, "held candidate not applied");
            }
        }
    }

    async fn prepare_offer(&self, id: LinkId) -> PeerResult<Value> {
        let link = self.open_link(id).await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn prepare_answer(&self, id: LinkId, offer: Value) -> PeerResult<Value> {
        let link = self.open_link(id).await?;
        link.set_remote_description(offer).await?;
        self.apply_held_candidates(id, &link).await;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn open_link(&self, id: LinkId) -> PeerResult<Arc<dyn PeerLink>> {
        let link = self.connector.open(id, self.events.clone()).await?;
        let attached = {
            let mut sessions = self.sessions.lock();
            match sessions
                .get_mut(&id.peer)
                .filter(|s| s.generation == id.generation && s.state.is_active())
            {
                Some(s) => {
                    s.link = Some(link.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            link.close().await;
            return Err(PeerError::NegotiationAborted(id.peer));
        }
        Ok(link)
    }

    /// Creates a fresh `Idle` session. With `replace`, an active session is
    /// displaced and handed back so the caller can tear it down.
    fn begin_session(
        &self,
        self_id: ClientId,
        other: ClientId,
        replace: bool,
    ) -> PeerResult<(u64, Option<ReplacedSession>)> {
        let mut sessions = self.sessions.lock();
        let mut replaced = None;
        if let Some(existing) = sessions.get_mut(&other) {
            if existing.state.is_active() {
                if !replace {
                    return Err(PeerError::SessionActive(other));
                }
                replaced = Some(ReplacedSession {
                    self_id: existing.self_id,
                    link: existing.link.take(),
                    was_connected: existing.state == SessionState::Connected,
                });
            }
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        sessions.insert(
            other,
            NegotiationSession {
                self_id,
                generation,
                state: SessionState::Idle,
                pending_local_description: None,
                link: None,
                outgoing_candidates: Vec::new(),
                description_sent: false,
                incoming_candidates: Vec::new(),
                remote_applied: false,
            },
        );
        Ok((generation, replaced))
    }

    /// Moves the session from `from` to `to` and returns the resulting state.
    /// A session in any other state is left alone.
    fn advance(
        &self,
        id: LinkId,
        from: SessionState,
        to: SessionState,
        pending_local_description: Option<Value>,
    ) -> PeerResult<SessionState> {
        let mut sessions = self.sessions.lock();
        let s = sessions
            .get_mut(&id.peer)
            .filter(|s| s.generation == id.generation)
            .ok_or(PeerError::NegotiationAborted(id.peer))?;
        if s.state.is_active() && pending_local_description.is_some() {
            s.pending_local_description = pending_local_description;
        }
        if s.state == from {
            s.state = to;
        }
        Ok(s.state)
    }

    /// Marks a failed negotiation closed and tears its link down.
    async fn abandon(&self, id: LinkId) {
        if let Some((_, Some(link))) = self.end_session(id.peer, Some(id.generation)) {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    struct Side {
        negotiator: Negotiator,
        connector: Arc<MockConnector>,
        relay_rx: mpsc::UnboundedReceiver<String>,
        events_rx: mpsc::UnboundedReceiver<LinkEvent>,
        bus: EventBus,
    }

    impl Side {
        async fn new(id: u64) -> Self {
            let connector = Arc::new(MockConnector::new());
            let relay = RelaySender::detached();
            let (tx, relay_rx) = mpsc::unbounded_channel();
            relay.attach(tx);
            let bus = EventBus::new();
            let (negotiator, events_rx) = Negotiator::new(connector.clone(), relay, bus.clone());
            negotiator
                .handle_signal(SignalEnvelope::client_id(cid(id)))
                .await;
            Self {
                negotiator,
                connector,
                relay_rx,
                events_rx,
                bus,
            }
        }

        fn sent_signals(&mut self) -> Vec<SignalEnvelope> {
            drain_signals(&mut self.relay_rx)
        }

        async fn pump_link_events(&mut self) {
            while let Ok(event) = self.events_rx.try_recv() {
                self.negotiator.handle_link_event(event).await;
            }
        }

        fn record(&self, topic: &'static str) -> Arc<SyncMutex<Vec<Value>>> {
            let seen = Arc::new(SyncMutex::new(Vec::new()));
            let sink = seen.clone();
            self.bus
                .subscribe(topic, move |d| sink.lock().push(d.payload().clone()));
            seen
        }
    }

    fn cid(raw: u64) -> ClientId {
        ClientId::new(raw).unwrap()
    }

    fn drain_signals(relay_rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<SignalEnvelope> {
        let mut out = Vec::new();
        while let Ok(frame) = relay_rx.try_recv() {
            if let Ok(Envelope::Signal(signal)) = Envelope::decode(&frame) {
                out.push(signal);
            }
        }
        out
    }

    fn actions(signals: &[SignalEnvelope]) -> Vec<SignalAction> {
        signals.iter().map(|s| s.action).collect()
    }

    /// Yields after setting the local description, the way webrtc-rs does
    /// while candidates are already being gathered.
    struct YieldingConnector(Arc<MockConnector>);

    struct YieldingLink(Arc<dyn PeerLink>);

    #[async_trait]
    impl PeerConnector for YieldingConnector {
        async fn open(&self, link: LinkId, events: LinkEvents) -> Result<Arc<dyn PeerLink>, LinkError> {
            let inner = self.0.open(link, events).await?;
            Ok(Arc::new(YieldingLink(inner)))
        }
    }

    #[async_trait]
    impl PeerLink for YieldingLink {
        async fn create_offer(&self) -> Result<Value, LinkError> {
            self.0.create_offer().await
        }

        async fn create_answer(&self) -> Result<Value, LinkError> {
            self.0.create_answer().await
        }

        async fn set_local_description(&self, description: Value) -> Result<(), LinkError> {
            let result = self.0.set_local_description(description).await;
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            result
        }

        async fn set_remote_description(&self, description: Value) -> Result<(), LinkError> {
            self.0.set_remote_description(description).await
        }

        async fn add_candidate(&self, candidate: Value) -> Result<(), LinkError> {
            self.0.add_candidate(candidate).await
        }

        fn is_open(&self) -> bool {
            self.0.is_open()
        }

        async fn send(&self, frame: String) -> Result<(), LinkError> {
            self.0.send(frame).await
        }

        async fn close(&self) {
            self.0.close().await
        }
    }

    /// Negotiator whose link events are pumped by a spawned task.
    async fn pumped_side(
        id: u64,
    ) -> (Arc<Negotiator>, Arc<MockConnector>, mpsc::UnboundedReceiver<String>) {
        let mock = Arc::new(MockConnector::new());
        let relay = RelaySender::detached();
        let (tx, relay_rx) = mpsc::unbounded_channel();
        relay.attach(tx);
        let (negotiator, events) = Negotiator::new(
            Arc::new(YieldingConnector(mock.clone())),
            relay,
            EventBus::new(),
        );
        let negotiator = Arc::new(negotiator);
        tokio::spawn(negotiator.clone().run_link_events(events));
        negotiator
            .handle_signal(SignalEnvelope::client_id(cid(id)))
            .await;
        (negotiator, mock, relay_rx)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn take_action(signals: &mut Vec<SignalEnvelope>, action: SignalAction) -> SignalEnvelope {
        let index = signals
            .iter()
            .position(|s| s.action == action)
            .unwrap_or_else(|| panic!("no {action:?} signal in {signals:?}"));
        signals.remove(index)
    }

    #[test_timeout::tokio_timeout_test]
    async fn initiate_requires_identity() {
        let connector = Arc::new(MockConnector::new());
        let (negotiator, _events) =
            Negotiator::new(connector, RelaySender::detached(), EventBus::new());
        let err = negotiator.initiate(cid(2)).await.unwrap_err();
        assert!(matches!(err, PeerError::NoIdentity));
    }

    #[test_timeout::tokio_timeout_test]
    async fn client_id_signal_is_published() {
        let connector = Arc::new(MockConnector::new());
        let bus = EventBus::new();
        let seen = Arc::new(SyncMutex::new(None));
        let slot = seen.clone();
        bus.subscribe(CLIENT_ID, move |d| *slot.lock() = Some(d.payload().clone()));
        let (negotiator, _events) = Negotiator::new(connector, RelaySender::detached(), bus);

        negotiator
            .handle_signal(SignalEnvelope::client_id(cid(5)))
            .await;
        assert_eq!(negotiator.self_id(), Some(cid(5)));
        assert_eq!(*seen.lock(), Some(json!(5)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn initiate_sends_offer_and_moves_to_offering() {
        let mut a = Side::new(1).await;
        a.negotiator.initiate(cid(2)).await.unwrap();

        let info = a.negotiator.session(cid(2)).unwrap();
        assert_eq!(info.state, SessionState::Offering);
        assert_eq!(info.self_id, cid(1));
        assert!(info.pending_local_description.is_some());

        let mut signals = a.sent_signals();
        let offer = take_action(&mut signals, SignalAction::Offer);
        assert_eq!(offer.from, Some(cid(1)));
        assert_eq!(offer.to, Some(cid(2)));
        assert_eq!(offer.data, info.pending_local_description);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_initiate_to_same_peer_is_rejected() {
        let a = Side::new(1).await;
        a.negotiator.initiate(cid(2)).await.unwrap();
        let err = a.negotiator.initiate(cid(2)).await.unwrap_err();
        assert!(matches!(err, PeerError::SessionActive(_)));
        assert!(matches!(
            a.negotiator.initiate(cid(1)).await.unwrap_err(),
            PeerError::SelfNegotiation(_)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_candidates_are_trickled_before_the_answer() {
        let mut a = Side::new(1).await;
        a.negotiator.initiate(cid(2)).await.unwrap();
        a.pump_link_events().await;

        let mut signals = a.sent_signals();
        take_action(&mut signals, SignalAction::Offer);
        let candidate = take_action(&mut signals, SignalAction::Candidate);
        assert_eq!(candidate.to, Some(cid(2)));
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Offering));
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_exchange_connects_both_sides_once() {
        let mut a = Side::new(1).await;
        let mut b = Side::new(2).await;
        let a_open = a.record(DC_OPEN);
        let b_open = b.record(DC_OPEN);

        a.negotiator.initiate(cid(2)).await.unwrap();
        let offer = take_action(&mut a.sent_signals(), SignalAction::Offer);
        b.negotiator.handle_signal(offer).await;

        let answer = take_action(&mut b.sent_signals(), SignalAction::Answer);
        a.negotiator.handle_signal(answer.clone()).await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::AwaitingAnswer));

        a.pump_link_events().await;
        b.pump_link_events().await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Connected));
        assert_eq!(b.negotiator.state(cid(1)), Some(SessionState::Connected));

        // duplicate answer is a no-op
        a.negotiator.handle_signal(answer).await;
        a.pump_link_events().await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Connected));

        assert_eq!(*a_open.lock(), vec![json!({"selfId": 1, "otherId": 2})]);
        assert_eq!(*b_open.lock(), vec![json!({"selfId": 2, "otherId": 1})]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_before_and_after_answer_do_not_change_outcome() {
        let mut a = Side::new(1).await;
        let mut b = Side::new(2).await;

        a.negotiator.initiate(cid(2)).await.unwrap();
        a.pump_link_events().await;
        let mut from_a = a.sent_signals();
        let offer = take_action(&mut from_a, SignalAction::Offer);
        let a_candidate = take_action(&mut from_a, SignalAction::Candidate);

        b.negotiator.handle_signal(offer).await;
        b.pump_link_events().await;
        let mut from_b = b.sent_signals();
        let answer = take_action(&mut from_b, SignalAction::Answer);
        let b_candidate = take_action(&mut from_b, SignalAction::Candidate);

        let a_link = a.connector.link(cid(2)).unwrap();
        let b_link = b.connector.link(cid(1)).unwrap();
        let b_candidate_data = b_candidate.data.clone().unwrap();
        let a_candidate_data = a_candidate.data.clone().unwrap();

        // b's candidate reaches a before the answer and is held back
        a.negotiator.handle_signal(b_candidate.clone()).await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Offering));
        assert!(a_link.candidates().is_empty());

        a.negotiator.handle_signal(answer).await;
        a.pump_link_events().await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Connected));
        assert_eq!(a_link.candidates(), vec![b_candidate_data.clone()]);

        // a's candidate after b is connected, and a duplicate of b's
        b.negotiator.handle_signal(a_candidate).await;
        a.negotiator.handle_signal(b_candidate).await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Connected));
        assert_eq!(b.negotiator.state(cid(1)), Some(SessionState::Connected));
        assert_eq!(b_link.candidates(), vec![a_candidate_data]);
        assert_eq!(a_link.candidates(), vec![b_candidate_data.clone(), b_candidate_data]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_never_overtake_descriptions_on_the_relay() {
        let (a, a_mock, mut a_relay) = pumped_side(1).await;
        let (b, b_mock, mut b_relay) = pumped_side(2).await;

        a.initiate(cid(2)).await.unwrap();
        settle().await;
        let from_a = drain_signals(&mut a_relay);
        assert_eq!(actions(&from_a), vec![SignalAction::Offer, SignalAction::Candidate]);

        for signal in from_a {
            b.handle_signal(signal).await;
        }
        settle().await;
        let from_b = drain_signals(&mut b_relay);
        assert_eq!(actions(&from_b), vec![SignalAction::Answer, SignalAction::Candidate]);

        for signal in from_b {
            a.handle_signal(signal).await;
        }
        settle().await;

        assert_eq!(a.state(cid(2)), Some(SessionState::Connected));
        assert_eq!(b.state(cid(1)), Some(SessionState::Connected));
        assert_eq!(a_mock.link(cid(2)).unwrap().candidates().len(), 1);
        assert_eq!(b_mock.link(cid(1)).unwrap().candidates().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_publishes_dc_closed_immediately() {
        let mut a = Side::new(1).await;
        let a_closed = a.record(DC_CLOSED);
        a.negotiator.initiate(cid(2)).await.unwrap();
        a.pump_link_events().await;

        a.negotiator.close_all().await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Closed));
        assert_eq!(*a_closed.lock(), vec![json!({"selfId": 1, "otherId": 2})]);

        // the link's own close event changes nothing
        a.pump_link_events().await;
        assert_eq!(a_closed.lock().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_without_offer_is_ignored() {
        let b = Side::new(2).await;
        let stray = SignalEnvelope::negotiation(
            SignalAction::Answer,
            cid(1),
            cid(2),
            json!({"type": "answer", "sdp": "mock"}),
        );
        b.negotiator.handle_signal(stray).await;
        assert_eq!(b.negotiator.state(cid(1)), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn channel_close_publishes_and_allows_fresh_session() {
        let mut a = Side::new(1).await;
        let mut b = Side::new(2).await;
        let a_closed = a.record(DC_CLOSED);

        a.negotiator.initiate(cid(2)).await.unwrap();
        let offer = take_action(&mut a.sent_signals(), SignalAction::Offer);
        b.negotiator.handle_signal(offer).await;
        let answer = take_action(&mut b.sent_signals(), SignalAction::Answer);
        a.negotiator.handle_signal(answer).await;
        a.pump_link_events().await;

        a.negotiator.close(cid(2)).await;
        a.pump_link_events().await;
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Closed));
        assert_eq!(*a_closed.lock(), vec![json!({"selfId": 1, "otherId": 2})]);
        assert!(a.negotiator.active_peers().is_empty());

        a.negotiator.initiate(cid(2)).await.unwrap();
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Offering));
        assert_eq!(a.connector.opened(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn direct_send_requires_open_channel() {
        let mut a = Side::new(1).await;
        let err = a
            .negotiator
            .publish_direct(cid(2), "pos", json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::ChannelNotReady(_)));

        a.negotiator.initiate(cid(2)).await.unwrap();
        a.pump_link_events().await;
        let err = a
            .negotiator
            .publish_direct(cid(2), "pos", json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::ChannelNotReady(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn direct_frames_are_dispatched_with_sender() {
        let mut a = Side::new(1).await;
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        a.bus.subscribe("pos", move |d| {
            sink.lock().push((d.sender(), d.payload().clone()));
        });

        a.negotiator.initiate(cid(2)).await.unwrap();
        a.pump_link_events().await;
        let link = a.connector.link(cid(2)).unwrap();
        link.deliver(r#"{"topic":"pos","payload":{"x":3}}"#);
        link.deliver(r#"{"topic":"dcOpen","payload":null}"#);
        a.pump_link_events().await;

        assert_eq!(*seen.lock(), vec![(Some(cid(2)), json!({"x": 3}))]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_offer_closes_session() {
        let a = Side::new(1).await;
        a.connector.fail_next_open();
        let err = a.negotiator.initiate(cid(2)).await.unwrap_err();
        assert!(matches!(err, PeerError::Link(_)));
        assert_eq!(a.negotiator.state(cid(2)), Some(SessionState::Closed));
    }

    #[test_timeout::tokio_timeout_test]
    async fn new_offer_replaces_connected_session() {
        let mut a = Side::new(1).await;
        let mut b = Side::new(2).await;
        let b_closed = b.record(DC_CLOSED);

        a.negotiator.initiate(cid(2)).await.unwrap();
        let offer = take_action(&mut a.sent_signals(), SignalAction::Offer);
        b.negotiator.handle_signal(offer.clone()).await;
        b.pump_link_events().await;
        assert_eq!(b.negotiator.state(cid(1)), Some(SessionState::Connected));
        let first_link = b.connector.link(cid(1)).unwrap();

        b.negotiator.handle_signal(offer).await;
        assert!(first_link.is_closed());
        assert_eq!(*b_closed.lock(), vec![json!({"selfId": 2, "otherId": 1})]);

        // the replaced link's close event must not touch the new session
        b.pump_link_events().await;
        assert_eq!(b.negotiator.state(cid(1)), Some(SessionState::Connected));
        assert_eq!(b.connector.opened(), 2);
    }
}
