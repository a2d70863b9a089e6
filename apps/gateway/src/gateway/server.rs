//! Per-socket event loop: pumps outbound frames to the socket and feeds
//! inbound socket activity into the connection until it closes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time;

use super::connection::{ConnectionInit, ConnectionState};
use super::query::QueryParams;
use super::registry::Registry;
use super::transport::{self, CloseInfo, Frame, FrameReceiver, TransportEvent, CLOSE_GOING_AWAY};

/// Upper bound on delivering the close frame of a server-side teardown.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) async fn serve_socket(
    registry: Arc<Registry>,
    socket: WebSocket,
    query: QueryParams,
    auth_data: Option<Value>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frames, outbound) = transport::channel();

    let conn = match registry.create_connection(ConnectionInit {
        query,
        auth_data,
        frames,
    }) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(error = %err, "refusing socket");
            let _ = ws_tx
                .send(into_message(Frame::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: err.to_string(),
                }))
                .await;
            return;
        }
    };

    let mut writer = tokio::spawn(write_frames(ws_tx, outbound));

    let closed_by_server = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let event = into_event(msg);
                let terminal = event.is_terminal();
                conn.handle_event(event).await;
                if terminal || conn.state() == ConnectionState::Closed {
                    break false;
                }
            }
            // Torn down from elsewhere (heartbeat, registry shutdown).
            () = conn.closed() => break true,
        }
    };

    // A server-side teardown leaves a close frame queued; the writer exits
    // once it is on the wire.
    if closed_by_server && time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_ok() {
        return;
    }
    writer.abort();
}

async fn write_frames(mut ws_tx: SplitSink<WebSocket, Message>, mut outbound: FrameReceiver) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Frame::Close { .. });
        if let Err(err) = ws_tx.send(into_message(frame)).await {
            tracing::debug!(?err, "ws write error");
            break;
        }
        if closing {
            break;
        }
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(payload) => Message::Ping(payload.into()),
        Frame::Pong(payload) => Message::Pong(payload.into()),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

fn into_event(msg: Option<Result<Message, axum::Error>>) -> TransportEvent {
    match msg {
        Some(Ok(Message::Text(text))) => TransportEvent::Message(text.as_str().to_owned()),
        Some(Ok(Message::Binary(bytes))) => TransportEvent::Binary(bytes.to_vec()),
        Some(Ok(Message::Ping(payload))) => TransportEvent::Ping(payload.to_vec()),
        Some(Ok(Message::Pong(_))) => TransportEvent::Pong,
        Some(Ok(Message::Close(frame))) => TransportEvent::Close(frame.map(|f| CloseInfo {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        })),
        Some(Err(err)) => TransportEvent::Error(err.to_string()),
        None => TransportEvent::Close(None),
    }
}
