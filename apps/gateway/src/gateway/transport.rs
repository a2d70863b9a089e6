//! The boundary between a [`Connection`](super::connection::Connection) and its socket.
//!
//! Outbound traffic is queued as [`Frame`]s on an unbounded channel drained by the
//! socket writer; inbound socket activity is delivered as [`TransportEvent`]s.

use tokio::sync::mpsc;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server shutting down or refusing the connection.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Socket failed without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Peer failed to answer a heartbeat ping within one interval.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4009;

/// An outbound instruction for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Something that happened on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close(Option<CloseInfo>),
    Error(String),
}

impl TransportEvent {
    /// Whether this event ends the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close(_) | Self::Error(_))
    }
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

pub fn channel() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}
