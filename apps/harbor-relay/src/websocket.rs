use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::router::EnvelopeRouter;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(router): State<EnvelopeRouter>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

/// Handle one endpoint connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, router: EnvelopeRouter) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Registration queues the identity frame ahead of any roster frame.
    let client_id = match router.accept(tx) {
        Ok(id) => id,
        Err(e) => {
            error!("Rejecting connection: {}", e);
            let _ = sender.close().await;
            return;
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(client_id = %client_id, "writer task ended");
    });

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                router.route(client_id, &text);
            }
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => {
                    router.route(client_id, &text);
                }
                Err(_) => debug!(client_id = %client_id, "ignoring non-utf8 binary frame"),
            },
            Message::Close(_) => {
                debug!(client_id = %client_id, "close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    router.disconnect(client_id);
    writer.abort();
}
