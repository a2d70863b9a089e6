use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use roomcast_common::{Envelope, PING, PONG};

use crate::error::ClientError;
use crate::handlers::{HandlerId, HandlerTable};
use crate::queue::OutboundQueue;

/// Notifications the client raises itself. They share the handler table with
/// server events.
pub mod events {
    /// Socket opened and the queue was flushed. Data is `null`.
    pub const OPEN: &str = "open";
    /// Socket closed. Data is `{code, reason}`.
    pub const CLOSE: &str = "close";
    /// Connect or transport failure. Data is `{message}`. A `close` always follows.
    pub const ERROR: &str = "error";
}

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_NO_STATUS: u16 = 1005;
const CLOSE_ABNORMAL: u16 = 1006;

/// Upper bound on flushing the close reply once the peer's close frame arrives.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Retry after every close until `disconnect(false)`.
    pub should_reconnect: bool,
    /// Overrides the queue bound for this and later sessions.
    pub max_queue_size: Option<usize>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            should_reconnect: true,
            max_queue_size: None,
        }
    }
}

enum Outbound {
    Envelope(Envelope),
    Pong,
    Close,
}

impl Outbound {
    fn into_envelope(self) -> Option<Envelope> {
        match self {
            Self::Envelope(envelope) => Some(envelope),
            Self::Pong | Self::Close => None,
        }
    }
}

struct Session {
    ready: ReadyState,
    url: String,
    interval: Duration,
    should_reconnect: bool,
    /// Bumped on every attempt. Tasks from older attempts must not touch state.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct ClientInner {
    session: Mutex<Session>,
    queue: Mutex<OutboundQueue>,
    handlers: Mutex<HandlerTable>,
}

/// A WebSocket client that reconnects after unexpected closes and replays
/// messages emitted while it was offline.
///
/// Lock order: `session` before `queue`. Handlers always run with no lock held.
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
}

impl Default for ReconnectingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectingClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session: Mutex::new(Session {
                    ready: ReadyState::Disconnected,
                    url: String::new(),
                    interval: Duration::from_secs(1),
                    should_reconnect: true,
                    generation: 0,
                    outbound: None,
                    task: None,
                    retry: None,
                }),
                queue: Mutex::new(OutboundQueue::default()),
                handlers: Mutex::new(HandlerTable::default()),
            }),
        }
    }

    /// Start connecting to `url`, retrying every `interval` after a close.
    ///
    /// Refused while a socket is connecting, open, or closing. Must be called
    /// from within a tokio runtime.
    pub fn connect(
        &self,
        url: impl Into<String>,
        interval: Duration,
        options: ConnectOptions,
    ) -> Result<(), ClientError> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;

        let mut session = self.inner.session.lock();
        match session.ready {
            ReadyState::Connecting => return Err(ClientError::AlreadyConnecting),
            ReadyState::Open | ReadyState::Closing => return Err(ClientError::AlreadyConnected),
            ReadyState::Disconnected => {}
        }
        session.url = url.into();
        session.interval = interval;
        session.should_reconnect = options.should_reconnect;
        if let Some(max) = options.max_queue_size {
            self.inner.queue.lock().set_max(max);
        }
        self.inner.start(&mut session, &runtime);
        Ok(())
    }

    /// Close the socket and cancel any pending retry. With `should_reconnect`
    /// the client reconnects after the close as usual.
    pub fn disconnect(&self, should_reconnect: bool) {
        let mut session = self.inner.session.lock();
        session.should_reconnect = should_reconnect;
        if let Some(retry) = session.retry.take() {
            retry.abort();
        }

        match session.ready {
            ReadyState::Open => {
                session.ready = ReadyState::Closing;
                if let Some(outbound) = &session.outbound {
                    let _ = outbound.send(Outbound::Close);
                }
            }
            ReadyState::Connecting => {
                if let Some(task) = session.task.take() {
                    task.abort();
                }
                let generation = session.generation;
                drop(session);
                self.inner
                    .transport_closed(generation, CLOSE_NORMAL, String::new(), Vec::new());
            }
            ReadyState::Closing | ReadyState::Disconnected => {}
        }
    }

    /// Send now if open, otherwise queue for the next session.
    pub fn emit(&self, event: impl Into<String>, data: Value) {
        let envelope = Envelope::new(event, data);
        let session = self.inner.session.lock();

        let envelope = match (&session.outbound, session.ready) {
            (Some(outbound), ReadyState::Open) => match outbound.send(Outbound::Envelope(envelope)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => match returned.into_envelope() {
                    Some(envelope) => envelope,
                    None => return,
                },
            },
            _ => envelope,
        };

        tracing::trace!(event = %envelope.event, "not connected, queueing message");
        self.inner.queue.lock().push(envelope);
    }

    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut table = self.inner.handlers.lock();
        let id = table.reserve_id();
        table.insert(event, id, Arc::new(handler));
        id
    }

    /// Like [`on`](Self::on), but the handler unsubscribes itself after its first call.
    pub fn once<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut table = self.inner.handlers.lock();
        let id = table.reserve_id();
        let client = Arc::downgrade(&self.inner);
        let name = event.to_string();
        let fired = AtomicBool::new(false);
        table.insert(
            event,
            id,
            Arc::new(move |data: &Value| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(client) = client.upgrade() {
                    client.handlers.lock().remove(&name, id);
                }
                handler(data);
            }),
        );
        id
    }

    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        self.inner.handlers.lock().remove(event, id)
    }

    /// Drop every handler registered for `event`.
    pub fn off_all(&self, event: &str) -> bool {
        self.inner.handlers.lock().remove_event(event)
    }

    pub fn clear_all_handlers(&self) {
        self.inner.handlers.lock().clear();
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.inner.handlers.lock().events()
    }

    pub fn is_connected(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.session.lock().ready
    }

    pub fn set_max_queue_size(&self, max: usize) {
        self.inner.queue.lock().set_max(max);
    }

    pub fn max_queue_size(&self) -> usize {
        self.inner.queue.lock().max()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl std::fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("ready_state", &self.ready_state())
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

impl ClientInner {
    fn start(self: &Arc<Self>, session: &mut Session, runtime: &Handle) {
        if let Some(retry) = session.retry.take() {
            retry.abort();
        }
        session.generation += 1;
        session.ready = ReadyState::Connecting;
        tracing::debug!(url = %session.url, generation = session.generation, "connecting");
        session.task = Some(runtime.spawn(run_session(
            Arc::downgrade(self),
            session.generation,
            session.url.clone(),
        )));
    }

    /// Mark the session open and hand it the backlog. Returns `false` when the
    /// attempt was superseded.
    fn opened(&self, generation: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        if let Some(retry) = session.retry.take() {
            retry.abort();
        }
        let backlog = self.queue.lock().drain();
        let flushed = backlog.len();
        for envelope in backlog {
            let _ = outbound.send(Outbound::Envelope(envelope));
        }
        session.ready = ReadyState::Open;
        session.outbound = Some(outbound);
        let url = session.url.clone();
        drop(session);

        tracing::info!(%url, flushed, "connected");
        self.fire(events::OPEN, &Value::Null);
        true
    }

    fn transport_error(&self, generation: u64, message: &str) {
        if self.session.lock().generation != generation {
            return;
        }
        self.fire(events::ERROR, &json!({ "message": message }));
    }

    fn transport_closed(
        self: &Arc<Self>,
        generation: u64,
        code: u16,
        reason: String,
        unsent: Vec<Envelope>,
    ) {
        let mut session = self.session.lock();
        if !unsent.is_empty() {
            tracing::debug!(count = unsent.len(), "requeueing unsent messages");
            self.queue.lock().requeue(unsent);
        }
        if session.generation != generation {
            return;
        }
        session.ready = ReadyState::Disconnected;
        session.outbound = None;
        session.task = None;

        let reconnect = session.should_reconnect;
        if reconnect {
            match Handle::try_current() {
                Ok(runtime) => {
                    session.retry = Some(runtime.spawn(retry_after(
                        Arc::downgrade(self),
                        generation,
                        session.interval,
                    )));
                }
                Err(_) => tracing::warn!("no tokio runtime, not scheduling reconnect"),
            }
        }
        drop(session);

        tracing::info!(code, %reason, reconnect, "disconnected");
        self.fire(events::CLOSE, &json!({ "code": code, "reason": reason }));
    }

    fn handle_text(&self, text: &str, outbound: &mpsc::UnboundedSender<Outbound>) {
        if text == PING {
            let _ = outbound.send(Outbound::Pong);
            return;
        }
        match Envelope::decode(text) {
            Ok(envelope) => self.fire(&envelope.event, &envelope.data),
            Err(err) => tracing::warn!(error = %err, "ignoring undecodable message"),
        }
    }

    fn fire(&self, event: &str, data: &Value) {
        let handlers = self.handlers.lock().snapshot(event);
        for handler in handlers {
            handler(data);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let session = self.session.get_mut();
        if let Some(retry) = session.retry.take() {
            retry.abort();
        }
        if let Some(task) = session.task.take() {
            task.abort();
        }
    }
}

async fn retry_after(client: Weak<ClientInner>, generation: u64, interval: Duration) {
    tokio::time::sleep(interval).await;

    let Some(inner) = client.upgrade() else {
        return;
    };
    let mut session = inner.session.lock();
    session.retry = None;
    if session.generation != generation || session.ready != ReadyState::Disconnected {
        return;
    }
    tracing::debug!(url = %session.url, "reconnecting");
    inner.start(&mut session, &Handle::current());
}

/// One socket, from handshake to close. Holds only a weak handle so dropping
/// the client ends it.
async fn run_session(client: Weak<ClientInner>, generation: u64, url: String) {
    let socket = match connect_async(url.as_str()).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            tracing::warn!(%url, error = %err, "connection attempt failed");
            if let Some(inner) = client.upgrade() {
                inner.transport_error(generation, &err.to_string());
                inner.transport_closed(generation, CLOSE_ABNORMAL, String::new(), Vec::new());
            }
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    match client.upgrade() {
        Some(inner) if inner.opened(generation, tx.clone()) => {}
        _ => return,
    }

    let (mut sink, mut stream) = socket.split();
    let mut close_info: Option<(u16, String)> = None;
    let mut failure: Option<String> = None;
    let mut unsent: Vec<Envelope> = Vec::new();

    loop {
        tokio::select! {
            Some(outbound) = rx.recv() => {
                let (message, envelope) = match outbound {
                    Outbound::Envelope(envelope) => match envelope.encode() {
                        Ok(text) => (Message::Text(text.into()), Some(envelope)),
                        Err(err) => {
                            tracing::warn!(event = %envelope.event, error = %err, "dropping unencodable message");
                            continue;
                        }
                    },
                    Outbound::Pong => (Message::Text(PONG.into()), None),
                    Outbound::Close => (
                        Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        })),
                        None,
                    ),
                };
                if let Err(err) = sink.send(message).await {
                    unsent.extend(envelope);
                    failure = Some(err.to_string());
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Some(inner) = client.upgrade() else { return };
                    inner.handle_text(text.as_str(), &tx);
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        let Some(inner) = client.upgrade() else { return };
                        inner.handle_text(text, &tx);
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring non-utf8 binary message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    close_info = Some(match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    });
                    // The handshake is done once a close frame is in; flush our
                    // reply and stop without waiting for the peer to drop TCP.
                    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await.is_err() {
                        tracing::debug!(%url, "timed out flushing close reply");
                    }
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    failure = Some(err.to_string());
                    break;
                }
                None => break,
            }
        }
    }

    // Anything accepted but never written goes back to the queue.
    rx.close();
    while let Ok(outbound) = rx.try_recv() {
        unsent.extend(outbound.into_envelope());
    }

    let Some(inner) = client.upgrade() else {
        return;
    };
    if let Some(message) = &failure {
        tracing::debug!(%url, error = %message, "transport error");
        inner.transport_error(generation, message);
    }
    let (code, reason) = close_info.unwrap_or((CLOSE_ABNORMAL, String::new()));
    inner.transport_closed(generation, code, reason, unsent);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_events(client: &ReconnectingClient) -> Vec<Value> {
        client
            .inner
            .queue
            .lock()
            .drain()
            .into_iter()
            .map(|e| e.data)
            .collect()
    }

    #[tokio::test]
    async fn unsent_envelopes_go_ahead_of_later_emits() {
        let client = ReconnectingClient::new();
        client.inner.session.lock().should_reconnect = false;
        client.emit("n", json!(3));

        let generation = client.inner.session.lock().generation;
        client.inner.transport_closed(
            generation,
            CLOSE_ABNORMAL,
            String::new(),
            vec![Envelope::new("n", json!(1)), Envelope::new("n", json!(2))],
        );

        assert_eq!(queued_events(&client), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(client.ready_state(), ReadyState::Disconnected);
    }

    #[tokio::test]
    async fn stale_session_still_returns_its_envelopes() {
        let client = ReconnectingClient::new();
        let closed = Arc::new(parking_lot::Mutex::new(0));
        let seen = closed.clone();
        client.on(events::CLOSE, move |_| *seen.lock() += 1);

        client.inner.session.lock().generation = 5;
        client.inner.transport_closed(
            4,
            CLOSE_ABNORMAL,
            String::new(),
            vec![Envelope::new("n", json!(1))],
        );

        assert_eq!(queued_events(&client), vec![json!(1)]);
        assert_eq!(*closed.lock(), 0);
    }
}
