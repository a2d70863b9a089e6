pub mod envelope;
pub mod id;

pub use envelope::{Envelope, EnvelopeError, PING, PONG};
pub use id::connection_id;
