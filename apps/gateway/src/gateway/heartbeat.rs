//! Registry-owned liveness timer.
//!
//! Runs while at least one connection is registered. Each tick calls
//! [`Registry::sweep`]; the task ends itself once the registry is empty or
//! gone and is aborted outright when the registry closes.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use super::registry::Registry;

pub(crate) fn spawn(runtime: &Handle, registry: Weak<Registry>, period: Duration) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // First tick fires immediately; skip it.

        loop {
            ticker.tick().await;

            let Some(registry) = registry.upgrade() else {
                break;
            };
            let pruned = registry.sweep();
            if pruned > 0 {
                tracing::info!(
                    pruned,
                    remaining = registry.connection_count(),
                    "heartbeat pruned dead connections"
                );
            }
            if registry.release_heartbeat_if_idle() {
                tracing::debug!("no connections left, heartbeat stopped");
                break;
            }
        }
    })
}
