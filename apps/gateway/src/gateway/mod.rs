pub mod connection;
pub mod handler;
mod heartbeat;
pub mod link;
pub mod query;
pub mod registry;
mod server;
pub mod transport;
pub mod upgrade;
pub mod variables;

pub use connection::{Connection, ConnectionInit, ConnectionState};
pub use handler::{handler, reject, EventHandler, HandlerError, HandlerResult};
pub use link::Link;
pub use query::{QueryParams, QueryValue};
pub use registry::{Registry, RegistryOptions};
pub use transport::{CloseInfo, Frame, TransportEvent};
pub use upgrade::{Authenticator, StaticTokenAuthenticator, UpgradeRequest};
