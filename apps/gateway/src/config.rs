use std::time::Duration;

use crate::gateway::registry::DEFAULT_HEARTBEAT_INTERVAL;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Path that accepts WebSocket upgrades.
    pub gateway_path: String,
    /// Period of the liveness sweep.
    pub heartbeat_interval: Duration,
    /// Shared secret required on upgrade. Unset means no authentication.
    pub gateway_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            gateway_path: "/ws".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            gateway_token: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            gateway_path: std::env::var("GATEWAY_PATH")
                .ok()
                .filter(|s| s.starts_with('/'))
                .unwrap_or(defaults.gateway_path),
            heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            gateway_token: std::env::var("GATEWAY_TOKEN").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
