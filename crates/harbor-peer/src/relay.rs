//! Endpoint side of the relay connection.

use futures_util::{SinkExt, StreamExt};
use harbor_proto::Envelope;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{PeerError, PeerResult};

/// What the relay socket reports to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Frame(String),
    Error(String),
    Closed,
}

/// Outbound half of the relay connection.
///
/// Starts detached; [`RelaySender::attach`] binds it to a live socket queue.
/// Clones share the binding.
#[derive(Debug, Clone, Default)]
pub struct RelaySender {
    tx: Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>,
}

impl RelaySender {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        *self.tx.write() = Some(tx);
    }

    pub fn detach(&self) {
        self.tx.write().take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx
            .read()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    pub fn send(&self, envelope: impl Into<Envelope>) -> PeerResult<()> {
        let frame = envelope.into().encode()?;
        self.send_raw(frame)
    }

    pub fn send_raw(&self, frame: String) -> PeerResult<()> {
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(PeerError::RelayNotConnected)?;
        tx.send(frame).map_err(|_| PeerError::RelayNotConnected)
    }
}

/// Live WebSocket to the relay.
pub struct RelayConnection {
    outbound: mpsc::UnboundedSender<String>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayConnection {
    /// Opens the socket. Frames and socket lifecycle are reported on the
    /// returned receiver; the last event is always [`RelayEvent::Closed`].
    pub async fn connect(url: &str) -> PeerResult<(Self, mpsc::UnboundedReceiver<RelayEvent>)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| PeerError::Relay(format!("{url}: {err}")))?;
        debug!(url, "relay socket open");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<RelayEvent>();
        let task = tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in));

        Ok((Self { outbound: tx_out, task }, rx_in))
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    pub fn into_task(self) -> tokio::task::JoinHandle<()> {
        self.task
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<RelayEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if tx_in.send(RelayEvent::Frame(text)).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    if tx_in.send(RelayEvent::Frame(text)).is_err() {
                        break;
                    }
                }
                Err(_) => debug!("ignoring non-utf8 binary frame from relay"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "relay socket error");
                let _ = tx_in.send(RelayEvent::Error(err.to_string()));
                break;
            }
        }
    }

    send_task.abort();
    let _ = send_task.await;
    let _ = tx_in.send(RelayEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_proto::{AppEnvelope, ClientId};
    use serde_json::json;

    #[test_timeout::timeout]
    fn detached_sender_refuses_frames() {
        let sender = RelaySender::detached();
        assert!(!sender.is_attached());
        let err = sender.send(AppEnvelope::new("chat", json!("hi"))).unwrap_err();
        assert!(matches!(err, PeerError::RelayNotConnected));
    }

    #[test_timeout::timeout]
    fn attached_sender_encodes_envelopes() {
        let sender = RelaySender::detached();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender.attach(tx);
        assert!(sender.is_attached());

        let to = ClientId::new(2);
        sender
            .send(AppEnvelope::new("chat", json!("hi")).addressed_to(to))
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame, json!({"topic": "chat", "payload": "hi", "to": 2}));

        sender.detach();
        assert!(!sender.is_attached());
    }

    #[test_timeout::timeout]
    fn closed_queue_counts_as_not_connected() {
        let sender = RelaySender::detached();
        let (tx, rx) = mpsc::unbounded_channel();
        sender.attach(tx);
        drop(rx);
        assert!(!sender.is_attached());
        assert!(matches!(
            sender.send_raw("{}".into()),
            Err(PeerError::RelayNotConnected)
        ));
    }
}
