use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast_gateway::config::Config;
use roomcast_gateway::gateway::registry::Registry;
use roomcast_gateway::gateway::upgrade::{Authenticator, StaticTokenAuthenticator};
use roomcast_gateway::GatewayState;

#[tokio::main]
async fn main() {
    // .env is optional; the environment may already carry the settings.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let registry = Registry::new(roomcast_gateway::app::registry_options(&config));

    let authenticator: Option<Arc<dyn Authenticator>> = config
        .gateway_token
        .as_ref()
        .map(|token| Arc::new(StaticTokenAuthenticator::new(token.clone())) as Arc<dyn Authenticator>);

    tracing::info!(
        path = %config.gateway_path,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        auth = authenticator.is_some(),
        "gateway configured"
    );

    let state = GatewayState {
        registry: registry.clone(),
        authenticator,
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(roomcast_gateway::routes::router(&config.gateway_path))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "roomcast-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Whether the server stopped cleanly or failed, no connection outlives it.
    registry.close();
    served.expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
