use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::GatewayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub rooms: usize,
}

pub fn router() -> Router<GatewayState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<GatewayState>) -> Json<HealthResponse> {
    let registry = &state.registry;
    Json(HealthResponse {
        status: if registry.is_closed() { "closing" } else { "ok" },
        connections: registry.connection_count(),
        rooms: registry.room_count(),
    })
}
