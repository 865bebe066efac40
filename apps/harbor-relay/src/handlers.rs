use axum::{extract::State, Json};
use serde::Serialize;

use crate::router::EnvelopeRouter;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub clients: usize,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(router): State<EnvelopeRouter>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        clients: router.client_count(),
    })
}
