//! Harbor relay: assigns identities to connected endpoints, announces the
//! roster, and forwards opaque envelopes by recipient or to everyone.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod websocket;

use axum::{routing::get, Router};
use harbor_proto::CodecError;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use registry::{ClientRegistry, RegisteredClient};
pub use router::{EnvelopeRouter, RouteOutcome};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client identity space exhausted")]
    IdentitiesExhausted,
    #[error("failed to encode relay frame: {0}")]
    Codec(#[from] CodecError),
    #[error("relay server failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay HTTP surface: `/` upgrades to the relay socket, `/health` reports status.
pub fn app(router: EnvelopeRouter) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .with_state(router)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on an already bound listener until the server stops.
pub async fn serve(listener: TcpListener, router: EnvelopeRouter) -> Result<(), RelayError> {
    axum::serve(listener, app(router)).await?;
    Ok(())
}
