//! Application event handlers and the chains they form.
//!
//! A chain is an ordered list of steps registered for one event name. Steps run
//! one after another; the first rejection stops the chain for that message and
//! is reported to the application's error handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::connection::Connection;

/// Reason a handler refused to let a message continue down its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for HandlerError {}

pub type HandlerResult = Result<(), HandlerError>;

/// Shorthand for rejecting inside a handler.
pub fn reject(reason: impl Into<String>) -> HandlerResult {
    Err(HandlerError::new(reason))
}

/// One step of an event chain.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, conn: Arc<Connection>, data: Value) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, conn: Arc<Connection>, data: Value) -> HandlerResult {
        (self)(conn, data).await
    }
}

pub type Chain = Arc<[Arc<dyn EventHandler>]>;

/// Box a function or closure as a chain step.
pub fn handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Connection>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Run one chain to completion or to its first rejection.
pub(crate) async fn run_chain(
    chain: &Chain,
    conn: &Arc<Connection>,
    data: &Value,
) -> HandlerResult {
    for step in chain.iter() {
        step.handle(conn.clone(), data.clone()).await?;
    }
    Ok(())
}
