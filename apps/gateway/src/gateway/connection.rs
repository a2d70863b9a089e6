//! Server-side handle to one live socket: identity, rooms, liveness, variables,
//! and dispatch of incoming envelopes to registered handler chains.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use roomcast_common::{Envelope, PING, PONG};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{GatewayError, VariableError};

use super::handler::{run_chain, Chain, EventHandler};
use super::query::QueryParams;
use super::registry::Registry;
use super::transport::{
    CloseInfo, Frame, FrameSender, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL,
};
use super::variables::Variables;

/// Immutable per-connection serial. Unlike the id it never changes, so the room
/// index is keyed on it.
pub type ConnKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Everything the upgrade path hands over when a connection is created.
pub struct ConnectionInit {
    pub query: QueryParams,
    pub auth_data: Option<Value>,
    pub frames: FrameSender,
}

pub struct Connection {
    key: ConnKey,
    pub(crate) id: RwLock<String>,
    /// Mirrors the registry's room index; only written under the registry lock.
    pub(crate) rooms: Mutex<HashSet<String>>,
    alive: AtomicBool,
    state: Mutex<ConnectionState>,
    closed: Notify,
    variables: Variables,
    auth_data: Option<Value>,
    query: QueryParams,
    handlers: RwLock<HashMap<String, Vec<Chain>>>,
    frames: FrameSender,
    registry: Weak<Registry>,
}

impl Connection {
    pub(crate) fn new(
        key: ConnKey,
        id: String,
        init: ConnectionInit,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            key,
            id: RwLock::new(id),
            rooms: Mutex::new(HashSet::new()),
            alive: AtomicBool::new(true),
            state: Mutex::new(ConnectionState::Open),
            closed: Notify::new(),
            variables: Variables::new(),
            auth_data: init.auth_data,
            query: init.query,
            handlers: RwLock::new(HashMap::new()),
            frames: init.frames,
            registry,
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Rebind this connection to an application-chosen id.
    ///
    /// Returns `false` if the registry refused the rename (the id is held by
    /// another connection, or this one is no longer registered).
    pub fn set_id(&self, new_id: impl Into<String>) -> bool {
        let new_id = new_id.into();
        match self.registry.upgrade() {
            Some(registry) => registry.rename_client(self, &new_id),
            None => {
                *self.id.write() = new_id;
                true
            }
        }
    }

    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }

    pub fn rooms(&self) -> HashSet<String> {
        self.rooms.lock().clone()
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    pub fn join(&self, room: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.to_clients([self.id()]).join(room);
        }
    }

    pub fn leave(&self, room: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.to_clients([self.id()]).leave(room);
        }
    }

    pub fn emit_s(&self, event: &str, data: Value) -> Result<(), GatewayError> {
        let text = Envelope::new(event, data).encode()?;
        self.send_text(text)
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), GatewayError> {
        self.send_frame(Frame::Text(text))
    }

    fn send_frame(&self, frame: Frame) -> Result<(), GatewayError> {
        if self.state() == ConnectionState::Closed {
            return Err(GatewayError::Transport("connection is closed".to_string()));
        }
        self.frames
            .send(frame)
            .map_err(|_| GatewayError::Transport("socket writer has shut down".to_string()))
    }

    /// Probe the peer. The connection counts as dead until a pong comes back.
    pub fn ping(&self) -> Result<(), GatewayError> {
        self.alive.store(false, Ordering::SeqCst);
        self.send_frame(Frame::Ping(Vec::new()))?;
        // Peers that only echo text payloads still answer this one.
        self.send_frame(Frame::Text(PING.to_string()))
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn auth_data(&self) -> Option<&Value> {
        self.auth_data.as_ref()
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn set_variable<T: Serialize>(&self, key: &str, value: T) -> Result<(), VariableError> {
        self.variables.set(key, value)
    }

    pub fn get_variable<T: DeserializeOwned>(&self, key: &str) -> Result<T, VariableError> {
        self.variables.get(key)
    }

    pub fn get_variable_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.variables.get_or(key, default)
    }

    pub fn remove_variable(&self, key: &str) -> Option<Value> {
        self.variables.remove(key)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn close(&self) {
        self.close_with(CLOSE_NORMAL, "");
    }

    /// Start the close handshake. Teardown happens once the socket reports closure.
    pub fn close_with(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }

        let frame = Frame::Close {
            code,
            reason: reason.to_string(),
        };
        if self.frames.send(frame).is_err() {
            // Nobody is left to complete the handshake.
            self.teardown(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            }));
        }
    }

    /// Close without waiting for the peer.
    pub(crate) fn terminate(&self, code: u16, reason: &str) {
        let _ = self.frames.send(Frame::Close {
            code,
            reason: reason.to_string(),
        });
        self.teardown(Some(CloseInfo {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Resolves once the connection has been torn down.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Register an ordered chain of handlers for `event`.
    ///
    /// Each call adds an independent chain; chains run in registration order.
    pub fn on_s<I>(&self, event: impl Into<String>, chain: I)
    where
        I: IntoIterator<Item = Arc<dyn EventHandler>>,
    {
        let chain: Chain = chain.into_iter().collect();
        if chain.is_empty() {
            return;
        }
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(chain);
    }

    /// Register a single-step chain.
    pub fn on<H: EventHandler + 'static>(&self, event: impl Into<String>, handler: H) {
        let step: Arc<dyn EventHandler> = Arc::new(handler);
        self.on_s(event, [step]);
    }

    /// Drop every chain registered for `event`.
    pub fn off(&self, event: &str) -> bool {
        self.handlers.write().remove(event).is_some()
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Feed one socket occurrence into the connection.
    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Pong => self.alive.store(true, Ordering::SeqCst),
            TransportEvent::Ping(payload) => {
                if let Err(err) = self.send_frame(Frame::Pong(payload)) {
                    tracing::debug!(conn_id = %self.id(), error = %err, "failed to answer ping");
                }
            }
            TransportEvent::Message(text) => self.handle_message(&text).await,
            TransportEvent::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.handle_message(&text).await,
                Err(err) => self.report_error(&GatewayError::Decode(err.to_string())),
            },
            TransportEvent::Close(info) => self.teardown(info),
            TransportEvent::Error(reason) => {
                tracing::debug!(conn_id = %self.id(), %reason, "transport error");
                self.teardown(Some(CloseInfo {
                    code: CLOSE_ABNORMAL,
                    reason,
                }));
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, text: &str) {
        let decoder = self
            .registry
            .upgrade()
            .and_then(|registry| registry.options().decoder.clone());

        let decoded = match decoder {
            Some(decode) => decode(text),
            None if text == PONG => {
                self.alive.store(true, Ordering::SeqCst);
                return;
            }
            None => Envelope::decode(text).map_err(GatewayError::from),
        };

        match decoded {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(err) => self.report_error(&err),
        }
    }

    /// Run every chain registered for the envelope's event, in order.
    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let chains = self
            .handlers
            .read()
            .get(&envelope.event)
            .cloned()
            .unwrap_or_default();

        if chains.is_empty() {
            tracing::trace!(conn_id = %self.id(), event = %envelope.event, "no handlers for event");
            return;
        }

        for chain in &chains {
            if let Err(rejection) = run_chain(chain, self, &envelope.data).await {
                self.report_error(&GatewayError::Handler {
                    event: envelope.event.clone(),
                    reason: rejection.reason,
                });
            }
        }
    }

    fn report_error(&self, err: &GatewayError) {
        match self
            .registry
            .upgrade()
            .and_then(|registry| registry.options().on_error.clone())
        {
            Some(on_error) => on_error(self, err),
            None => tracing::warn!(conn_id = %self.id(), error = %err, "unhandled connection error"),
        }
    }

    /// Shared close/error path. Runs at most once.
    pub(crate) fn teardown(&self, info: Option<CloseInfo>) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        if let Some(registry) = self.registry.upgrade() {
            let rooms: Vec<String> = self.rooms.lock().iter().cloned().collect();
            registry.to_none().remove_client_in_room(self, &rooms);
            if let Some(on_close) = registry.options().on_close.clone() {
                on_close(self, info.as_ref());
            }
            registry.remove_client(self);
        }

        self.variables.clear();
        self.handlers.write().clear();
        self.closed.notify_waiters();

        tracing::info!(
            conn_id = %self.id(),
            code = ?info.as_ref().map(|i| i.code),
            "connection closed"
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("id", &*self.id.read())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::handler::{handler, reject, HandlerError, HandlerResult};
    use crate::gateway::registry::RegistryOptions;
    use crate::gateway::transport::{self, FrameReceiver};
    use async_trait::async_trait;
    use serde_json::json;

    struct Step {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Step {
        async fn handle(&self, _conn: Arc<Connection>, _data: Value) -> HandlerResult {
            self.log.lock().push(self.name);
            if self.fail {
                reject(format!("{} refused", self.name))
            } else {
                Ok(())
            }
        }
    }

    fn step(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Step {
            name,
            log: log.clone(),
            fail,
        })
    }

    fn error_sink() -> (RegistryOptions, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let options = RegistryOptions::default().on_error(move |_conn, err| {
            sink.lock().push(err.to_string());
        });
        (options, errors)
    }

    fn connect(registry: &Arc<Registry>) -> (Arc<Connection>, FrameReceiver) {
        let (frames, rx) = transport::channel();
        let conn = registry
            .create_connection(ConnectionInit {
                query: QueryParams::default(),
                auth_data: Some(json!({"user": "ada"})),
                frames,
            })
            .unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut FrameReceiver) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn failing_step_stops_its_chain() {
        let (options, errors) = error_sink();
        let registry = Registry::new(options);
        let (conn, _rx) = connect(&registry);
        let log = Arc::new(Mutex::new(Vec::new()));

        conn.on_s(
            "save",
            [step("h1", &log, true), step("h2", &log, false), step("h3", &log, false)],
        );
        conn.handle_event(TransportEvent::Message(r#"{"event":"save","data":1}"#.into()))
            .await;

        assert_eq!(*log.lock(), vec!["h1"]);
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("h1 refused"));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn chain_runs_in_order_and_later_messages_still_arrive() {
        let (options, errors) = error_sink();
        let registry = Registry::new(options);
        let (conn, _rx) = connect(&registry);
        let log = Arc::new(Mutex::new(Vec::new()));

        conn.on_s("a", [step("a1", &log, false), step("a2", &log, false)]);
        conn.on_s("b", [step("b1", &log, true)]);

        conn.dispatch(Envelope::new("b", Value::Null)).await;
        conn.dispatch(Envelope::new("a", Value::Null)).await;

        assert_eq!(*log.lock(), vec!["b1", "a1", "a2"]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn independent_chains_for_one_event() {
        let (options, errors) = error_sink();
        let registry = Registry::new(options);
        let (conn, _rx) = connect(&registry);
        let log = Arc::new(Mutex::new(Vec::new()));

        conn.on_s("e", [step("x1", &log, true), step("x2", &log, false)]);
        conn.on_s("e", [step("y1", &log, false)]);
        conn.dispatch(Envelope::new("e", Value::Null)).await;

        assert_eq!(*log.lock(), vec!["x1", "y1"]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn closure_handlers_receive_data() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, mut rx) = connect(&registry);

        conn.on_s(
            "echo",
            [handler(|conn: Arc<Connection>, data: Value| async move {
                conn.emit_s("echoed", data)
                    .map_err(|e| HandlerError::new(e.to_string()))
            })],
        );
        conn.handle_event(TransportEvent::Message(r#"{"event":"echo","data":{"n":2}}"#.into()))
            .await;

        let frames = drain(&mut rx);
        let Frame::Text(text) = &frames[0] else {
            panic!("expected text frame, got {frames:?}");
        };
        let env = Envelope::decode(text).unwrap();
        assert_eq!(env.event, "echoed");
        assert_eq!(env.data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn decode_failures_go_to_error_handler() {
        let (options, errors) = error_sink();
        let registry = Registry::new(options);
        let (conn, _rx) = connect(&registry);

        conn.handle_event(TransportEvent::Message("{not json".into())).await;
        conn.handle_event(TransportEvent::Message(r#"{"data":1}"#.into())).await;
        conn.handle_event(TransportEvent::Binary(vec![0xff, 0xfe])).await;

        let errors = errors.lock();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].starts_with("failed to decode"));
        assert_eq!(errors[1], "message has no event name");
        assert!(errors[2].starts_with("failed to decode"));
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn ping_then_pong_restores_liveness() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, mut rx) = connect(&registry);
        assert!(conn.alive());

        conn.ping().unwrap();
        assert!(!conn.alive());
        assert_eq!(
            drain(&mut rx),
            vec![Frame::Ping(Vec::new()), Frame::Text(PING.to_string())]
        );

        conn.handle_event(TransportEvent::Pong).await;
        assert!(conn.alive());

        conn.ping().unwrap();
        conn.handle_event(TransportEvent::Message(PONG.into())).await;
        assert!(conn.alive());
    }

    #[tokio::test]
    async fn transport_ping_is_answered() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, mut rx) = connect(&registry);

        conn.handle_event(TransportEvent::Ping(vec![1, 2])).await;
        assert_eq!(drain(&mut rx), vec![Frame::Pong(vec![1, 2])]);
    }

    #[tokio::test]
    async fn custom_decoder_takes_precedence() {
        let registry = Registry::new(RegistryOptions::default().with_decoder(|text| {
            Ok(Envelope::new("raw", Value::String(text.to_string())))
        }));
        let (conn, _rx) = connect(&registry);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.on(
            "raw",
            move |_conn: Arc<Connection>, data: Value| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(data);
                    HandlerResult::Ok(())
                }
            },
        );

        conn.ping().unwrap();
        conn.handle_event(TransportEvent::Message(PONG.into())).await;

        assert_eq!(*seen.lock(), vec![json!("pong")]);
        assert!(!conn.alive());
    }

    #[tokio::test]
    async fn close_and_error_share_teardown() {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = closes.clone();
        let registry = Registry::new(RegistryOptions::default().on_close(move |conn, info| {
            sink.lock().push((conn.id(), info.map(|i| i.code)));
        }));

        let (a, _rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);
        a.join("lobby");
        b.join("lobby");
        b.join("solo");

        a.handle_event(TransportEvent::Close(Some(CloseInfo {
            code: CLOSE_NORMAL,
            reason: "bye".into(),
        })))
        .await;
        b.handle_event(TransportEvent::Error("reset by peer".into())).await;
        // A late close after the error must not notify twice.
        b.handle_event(TransportEvent::Close(None)).await;

        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(a.rooms().is_empty());
        assert!(b.rooms().is_empty());
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.is_exist_room("lobby"));
        assert!(!registry.is_exist_room("solo"));

        let closes = closes.lock();
        assert_eq!(closes.len(), 2);
        assert_eq!(closes[0], (a.id(), Some(CLOSE_NORMAL)));
        assert_eq!(closes[1], (b.id(), Some(CLOSE_ABNORMAL)));
    }

    #[tokio::test]
    async fn close_sends_frame_and_waits_for_peer() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, mut rx) = connect(&registry);

        conn.close_with(4000, "done");
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(
            drain(&mut rx),
            vec![Frame::Close {
                code: 4000,
                reason: "done".into()
            }]
        );
        assert_eq!(registry.connection_count(), 1);

        conn.handle_event(TransportEvent::Close(None)).await;
        conn.closed().await;
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn close_without_writer_tears_down_immediately() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, rx) = connect(&registry);
        drop(rx);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(registry.connection_count(), 0);
        assert!(conn.emit_s("x", Value::Null).is_err());
    }

    #[tokio::test]
    async fn immutable_snapshot_and_variables() {
        let registry = Registry::new(RegistryOptions::default());
        let (conn, _rx) = connect(&registry);

        assert_eq!(conn.auth_data(), Some(&json!({"user": "ada"})));
        assert!(conn.query().is_empty());

        conn.set_variable("score", 10u32).unwrap();
        assert_eq!(conn.get_variable::<u32>("score").unwrap(), 10);
        assert_eq!(conn.get_variable_or("missing", 1u32), 1);

        conn.terminate(CLOSE_NORMAL, "");
        assert!(conn.variables().is_empty());
    }
}
