//! In-memory stand-in for the peer-to-peer primitive.
//!
//! A [`MockLink`] reports one local candidate when its local description is
//! set and opens once both descriptions are in place. Frames it is asked to
//! send are recorded rather than transmitted; tests move them to the other
//! side with [`MockLink::deliver`].

use async_trait::async_trait;
use harbor_proto::ClientId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::link::{LinkError, LinkEvent, LinkEventKind, LinkEvents, LinkId, PeerConnector, PeerLink};

#[derive(Default)]
pub struct MockConnector {
    links: Mutex<HashMap<ClientId, Arc<MockLink>>>,
    opened: Mutex<usize>,
    fail_next: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent link opened towards `peer`.
    pub fn link(&self, peer: ClientId) -> Option<Arc<MockLink>> {
        self.links.lock().get(&peer).cloned()
    }

    pub fn opened(&self) -> usize {
        *self.opened.lock()
    }

    /// Makes the next `open` fail as a broken primitive would.
    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn open(&self, link: LinkId, events: LinkEvents) -> Result<Arc<dyn PeerLink>, LinkError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Primitive("mock open failure".into()));
        }
        let mock = Arc::new(MockLink::new(link, events));
        self.links.lock().insert(link.peer, mock.clone());
        *self.opened.lock() += 1;
        Ok(mock)
    }
}

#[derive(Default)]
struct MockLinkState {
    local: Option<Value>,
    remote: Option<Value>,
    candidates: Vec<Value>,
    sent: Vec<String>,
    open: bool,
    closed: bool,
}

pub struct MockLink {
    id: LinkId,
    events: LinkEvents,
    state: Mutex<MockLinkState>,
}

impl MockLink {
    fn new(id: LinkId, events: LinkEvents) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(MockLinkState::default()),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Remote candidates applied so far.
    pub fn candidates(&self) -> Vec<Value> {
        self.state.lock().candidates.clone()
    }

    pub fn remote_description(&self) -> Option<Value> {
        self.state.lock().remote.clone()
    }

    /// Frames handed to `send` while the channel was open.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Reports `text` as a frame received from the remote side.
    pub fn deliver(&self, text: impl Into<String>) {
        self.emit(LinkEventKind::Message(text.into()));
    }

    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent::new(self.id, kind));
    }

    fn description(&self, kind: &str) -> Value {
        json!({
            "type": kind,
            "sdp": format!("mock-{kind}-{}-{}", self.id.peer, self.id.generation),
        })
    }

    fn open_if_ready(&self, state: &mut MockLinkState) {
        if !state.open && !state.closed && state.local.is_some() && state.remote.is_some() {
            state.open = true;
            self.emit(LinkEventKind::Open);
        }
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<Value, LinkError> {
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<Value, LinkError> {
        if self.state.lock().remote.is_none() {
            return Err(LinkError::Primitive("answer requires a remote offer".into()));
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(&self, description: Value) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.local = Some(description);
        self.emit(LinkEventKind::LocalCandidate(json!({
            "candidate": format!("candidate:mock {} {}", self.id.peer, self.id.generation),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })));
        self.open_if_ready(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), LinkError> {
        if description.get("sdp").and_then(Value::as_str).is_none() {
            return Err(LinkError::InvalidPayload("description without sdp".into()));
        }
        let mut state = self.state.lock();
        state.remote = Some(description);
        self.open_if_ready(&mut state);
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(LinkError::Primitive("no remote description".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.open && !state.closed
    }

    async fn send(&self, frame: String) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.open || state.closed {
            return Err(LinkError::NotOpen);
        }
        state.sent.push(frame);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.emit(LinkEventKind::Closed);
    }
}
