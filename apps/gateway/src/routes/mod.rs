pub mod health;

use axum::Router;

use crate::GatewayState;

pub fn router(gateway_path: &str) -> Router<GatewayState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::upgrade::router(gateway_path))
}
