//! Client side of the roomcast gateway.
//!
//! [`ReconnectingClient`] keeps one WebSocket open to a gateway, retries on a
//! fixed interval after unexpected closes, and replays messages emitted while
//! offline from a bounded queue once the next session opens. Incoming
//! `{event, data}` envelopes fan out to handlers registered with `on`/`once`.

mod client;
mod error;
mod handlers;
mod queue;

pub use client::{events, ConnectOptions, ReadyState, ReconnectingClient};
pub use error::ClientError;
pub use handlers::{Handler, HandlerId};
pub use queue::DEFAULT_MAX_QUEUE_SIZE;
