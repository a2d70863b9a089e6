pub mod app;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;

use std::sync::Arc;

use config::Config;
use gateway::registry::Registry;
use gateway::upgrade::Authenticator;

/// Shared state available to all route handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<Registry>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub config: Arc<Config>,
}
