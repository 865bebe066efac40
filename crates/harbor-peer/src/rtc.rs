//! WebRTC implementation of the link seam.
//!
//! Each side creates its own data channel and sends on it; frames arrive on
//! the channel the remote side created, which is also the one whose open and
//! close drive the link events.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::PeerConfig;
use crate::link::{LinkError, LinkEvent, LinkEventKind, LinkEvents, LinkId, PeerConnector, PeerLink};

fn primitive(err: impl std::fmt::Display) -> LinkError {
    LinkError::Primitive(err.to_string())
}

/// Opens one `RTCPeerConnection` per negotiation.
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
    label: String,
    ordered: bool,
    max_retransmits: Option<u16>,
}

impl RtcConnector {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            label: config.data_channel_label.clone(),
            ordered: config.ordered,
            max_retransmits: config.max_retransmits,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

/// Reports `Closed` at most once per link.
#[derive(Clone)]
struct CloseReporter {
    id: LinkId,
    events: LinkEvents,
    reported: Arc<AtomicBool>,
}

impl CloseReporter {
    fn report(&self) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(LinkEvent::new(self.id, LinkEventKind::Closed));
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(&self, id: LinkId, events: LinkEvents) -> Result<Arc<dyn PeerLink>, LinkError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(primitive)?,
        );
        let closer = CloseReporter {
            id,
            events: events.clone(),
            reported: Arc::new(AtomicBool::new(false)),
        };

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(json)) => {
                        let _ = events.send(LinkEvent::new(id, LinkEventKind::LocalCandidate(json)));
                    }
                    Ok(Err(err)) => warn!(error = %err, "failed to encode local candidate"),
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let state_closer = closer.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let closer = state_closer.clone();
            Box::pin(async move {
                debug!(peer = %closer.id.peer, ?state, "peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    closer.report();
                }
            })
        }));

        let channel_events = events.clone();
        let channel_closer = closer.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            let closer = channel_closer.clone();
            Box::pin(async move {
                debug!(peer = %id.peer, label = dc.label(), "remote data channel announced");
                watch_remote_channel(id, &dc, events, closer);
            })
        }));

        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            max_retransmits: self.max_retransmits,
            ..Default::default()
        };
        let channel = pc
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(primitive)?;

        Ok(Arc::new(RtcLink { pc, channel, closer }))
    }
}

fn watch_remote_channel(id: LinkId, dc: &Arc<RTCDataChannel>, events: LinkEvents, closer: CloseReporter) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            let _ = events.send(LinkEvent::new(id, LinkEventKind::Open));
        })
    }));

    dc.on_close(Box::new(move || {
        let closer = closer.clone();
        Box::pin(async move {
            closer.report();
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(LinkEvent::new(id, LinkEventKind::Message(text)));
                }
                Err(_) => debug!(peer = %id.peer, "ignoring non-utf8 data channel frame"),
            }
        })
    }));
}

pub struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    closer: CloseReporter,
}

fn parse_description(description: Value) -> Result<RTCSessionDescription, LinkError> {
    let kind = description
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::InvalidPayload("description without type".into()))?;
    let sdp = description
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or_else(|| LinkError::InvalidPayload("description without sdp".into()))?
        .to_string();
    match kind {
        "offer" => RTCSessionDescription::offer(sdp).map_err(primitive),
        "answer" => RTCSessionDescription::answer(sdp).map_err(primitive),
        "pranswer" => RTCSessionDescription::pranswer(sdp).map_err(primitive),
        other => Err(LinkError::InvalidPayload(format!(
            "unsupported description type {other}"
        ))),
    }
}

fn description_json(description: &RTCSessionDescription) -> Result<Value, LinkError> {
    serde_json::to_value(description).map_err(|err| LinkError::InvalidPayload(err.to_string()))
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<Value, LinkError> {
        let offer = self.pc.create_offer(None).await.map_err(primitive)?;
        description_json(&offer)
    }

    async fn create_answer(&self) -> Result<Value, LinkError> {
        let answer = self.pc.create_answer(None).await.map_err(primitive)?;
        description_json(&answer)
    }

    async fn set_local_description(&self, description: Value) -> Result<(), LinkError> {
        let description = parse_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(primitive)
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), LinkError> {
        let description = parse_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(primitive)
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), LinkError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|err| LinkError::InvalidPayload(err.to_string()))?;
        self.pc.add_ice_candidate(init).await.map_err(primitive)
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, frame: String) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        self.channel.send_text(frame).await.map_err(primitive)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "error closing peer connection");
        }
        self.closer.report();
    }
}
