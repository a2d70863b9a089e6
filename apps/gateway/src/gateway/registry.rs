//! Process-wide authority over connection identity and room membership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use roomcast_common::{connection_id, Envelope};
use tokio::task::JoinHandle;

use crate::error::GatewayError;

use super::connection::{ConnKey, Connection, ConnectionInit};
use super::heartbeat;
use super::link::Link;
use super::transport::{CloseInfo, CLOSE_GOING_AWAY, CLOSE_HEARTBEAT_TIMEOUT};

/// How often the heartbeat sweep runs unless configured otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Connection, Option<&CloseInfo>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Connection, &GatewayError) + Send + Sync>;
pub type MessageDecoder = Arc<dyn Fn(&str) -> Result<Envelope, GatewayError> + Send + Sync>;

/// Construction-time settings and application callbacks.
#[derive(Clone)]
pub struct RegistryOptions {
    pub heartbeat_interval: Duration,
    pub on_connection: Option<ConnectionCallback>,
    pub on_close: Option<CloseCallback>,
    pub on_error: Option<ErrorCallback>,
    /// Replaces the built-in envelope parsing, including the `"pong"` shortcut.
    pub decoder: Option<MessageDecoder>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            on_connection: None,
            on_close: None,
            on_error: None,
            decoder: None,
        }
    }
}

impl RegistryOptions {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn on_connection<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, Option<&CloseInfo>) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection, &GatewayError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_decoder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Result<Envelope, GatewayError> + Send + Sync + 'static,
    {
        self.decoder = Some(Arc::new(f));
        self
    }
}

/// Both indexes live under one lock so they always change together.
#[derive(Default)]
pub(crate) struct Indexes {
    pub(crate) connections: HashMap<String, Arc<Connection>>,
    pub(crate) rooms: HashMap<String, HashMap<ConnKey, Arc<Connection>>>,
}

impl Indexes {
    fn is_registered(&self, conn: &Connection) -> bool {
        self.connections
            .get(&*conn.id.read())
            .is_some_and(|c| c.key() == conn.key())
    }

    /// Put `conn` into `room`, creating the room on first member.
    ///
    /// Returns `false` if it was already a member or is no longer registered.
    pub(crate) fn attach(&mut self, conn: &Arc<Connection>, room: &str) -> bool {
        if !self.is_registered(conn) {
            return false;
        }
        let members = self.rooms.entry(room.to_string()).or_default();
        if members.insert(conn.key(), conn.clone()).is_some() {
            return false;
        }
        conn.rooms.lock().insert(room.to_string());
        true
    }

    /// Take `conn` out of `room`, deleting the room once it is empty.
    pub(crate) fn detach(&mut self, conn: &Connection, room: &str) -> bool {
        let mut removed = false;
        if let Some(members) = self.rooms.get_mut(room) {
            removed = members.remove(&conn.key()).is_some();
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
        conn.rooms.lock().remove(room);
        removed
    }
}

pub struct Registry {
    pub(crate) indexes: RwLock<Indexes>,
    options: RegistryOptions,
    next_key: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    this: Weak<Registry>,
}

impl Registry {
    pub fn new(options: RegistryOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            indexes: RwLock::new(Indexes::default()),
            options,
            next_key: AtomicU64::new(1),
            heartbeat: Mutex::new(None),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Build, register, and announce a connection for a freshly upgraded socket.
    pub fn create_connection(&self, init: ConnectionInit) -> Result<Arc<Connection>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::RegistryClosed);
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            key,
            connection_id(),
            init,
            self.this.clone(),
        ));
        self.add_client(conn.clone());

        tracing::info!(conn_id = %conn.id(), "connection registered");

        if let Some(on_connection) = &self.options.on_connection {
            on_connection(&conn);
        }
        Ok(conn)
    }

    /// Insert into the primary index. The caller guarantees a fresh id.
    pub fn add_client(&self, conn: Arc<Connection>) {
        self.indexes.write().connections.insert(conn.id(), conn);
        self.ensure_heartbeat();
    }

    /// Drop from the primary index, along with any room entries still pointing at it.
    pub fn remove_client(&self, conn: &Connection) {
        let mut indexes = self.indexes.write();
        let rooms: Vec<String> = conn.rooms.lock().iter().cloned().collect();
        for room in &rooms {
            indexes.detach(conn, room);
        }
        let id = conn.id();
        if indexes
            .connections
            .get(&id)
            .is_some_and(|c| c.key() == conn.key())
        {
            indexes.connections.remove(&id);
        }
    }

    /// Atomically move `conn` to `new_id` in the primary index.
    ///
    /// No-op returning `false` when `conn` is not registered under its current id
    /// or `new_id` already belongs to another connection.
    pub fn rename_client(&self, conn: &Connection, new_id: &str) -> bool {
        let mut indexes = self.indexes.write();
        let old_id = conn.id();
        if old_id == new_id {
            return indexes.is_registered(conn);
        }
        if indexes.connections.contains_key(new_id) {
            tracing::warn!(%old_id, %new_id, "rename refused: id already in use");
            return false;
        }
        let Some(entry) = indexes.connections.remove(&old_id) else {
            return false;
        };
        if entry.key() != conn.key() {
            indexes.connections.insert(old_id, entry);
            return false;
        }
        *conn.id.write() = new_id.to_string();
        indexes.connections.insert(new_id.to_string(), entry);

        tracing::debug!(%old_id, %new_id, "connection renamed");
        true
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Connection>> {
        self.indexes.read().connections.get(id).cloned()
    }

    /// Link over the registered connections with these ids; unknown ids are skipped.
    pub fn to_clients<I, S>(&self, ids: I) -> Link<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let indexes = self.indexes.read();
        let mut selected: HashMap<ConnKey, Arc<Connection>> = HashMap::new();
        for id in ids {
            if let Some(conn) = indexes.connections.get(id.as_ref()) {
                selected.entry(conn.key()).or_insert_with(|| conn.clone());
            }
        }
        drop(indexes);
        Link::new(self, selected.into_values().collect())
    }

    /// Link over the union of the named rooms' members; unknown rooms add nothing.
    pub fn to_rooms<I, S>(&self, rooms: I) -> Link<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let indexes = self.indexes.read();
        let mut rooms = rooms.into_iter();
        let mut selected = match rooms.next() {
            Some(first) => indexes
                .rooms
                .get(first.as_ref())
                .cloned()
                .unwrap_or_default(),
            None => HashMap::new(),
        };
        for room in rooms {
            if let Some(members) = indexes.rooms.get(room.as_ref()) {
                for (key, conn) in members {
                    selected.entry(*key).or_insert_with(|| conn.clone());
                }
            }
        }
        drop(indexes);
        Link::new(self, selected.into_values().collect())
    }

    pub fn to_all(&self) -> Link<'_> {
        let targets = self.indexes.read().connections.values().cloned().collect();
        Link::new(self, targets)
    }

    /// Link over the registered connections matching `predicate`.
    pub fn filter<P>(&self, predicate: P) -> Link<'_>
    where
        P: Fn(&Connection) -> bool,
    {
        // The predicate may call back into the registry, so it runs unlocked.
        let snapshot: Vec<Arc<Connection>> =
            self.indexes.read().connections.values().cloned().collect();
        let targets = snapshot
            .into_iter()
            .filter(|conn| predicate(conn))
            .collect();
        Link::new(self, targets)
    }

    /// Link with no targets, for mutating rooms on behalf of an outside connection.
    pub(crate) fn to_none(&self) -> Link<'_> {
        Link::new(self, Vec::new())
    }

    pub fn is_exist_room(&self, room: &str) -> bool {
        self.indexes.read().rooms.contains_key(room)
    }

    /// Ids of the current members of `room`.
    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.indexes
            .read()
            .rooms
            .get(room)
            .map(|members| members.values().map(|c| c.id()).collect())
            .unwrap_or_default()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.indexes.read().rooms.keys().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.indexes.read().connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.indexes.read().rooms.len()
    }

    /// One liveness pass: drop connections that never answered the last ping,
    /// ping the rest. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let snapshot: Vec<Arc<Connection>> =
            self.indexes.read().connections.values().cloned().collect();

        let mut pruned = 0;
        for conn in snapshot {
            if !conn.alive() {
                tracing::debug!(conn_id = %conn.id(), "no pong since last ping, terminating");
                conn.terminate(CLOSE_HEARTBEAT_TIMEOUT, "Heartbeat timeout");
                pruned += 1;
            } else if let Err(err) = conn.ping() {
                tracing::debug!(conn_id = %conn.id(), error = %err, "failed to ping connection");
            }
        }
        pruned
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn ensure_heartbeat(&self) {
        if self.is_closed() {
            return;
        }
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                *heartbeat = Some(heartbeat::spawn(
                    &runtime,
                    self.this.clone(),
                    self.options.heartbeat_interval,
                ));
            }
            Err(_) => tracing::debug!("no tokio runtime, heartbeat not started"),
        }
    }

    /// Called by the heartbeat task after each sweep. Clears the task slot and
    /// returns `true` when there is nothing left to watch.
    pub(crate) fn release_heartbeat_if_idle(&self) -> bool {
        let mut heartbeat = self.heartbeat.lock();
        if self.is_closed() || self.indexes.read().connections.is_empty() {
            heartbeat.take();
            return true;
        }
        false
    }

    /// Stop the heartbeat, close every connection, and clear both indexes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }

        let snapshot: Vec<Arc<Connection>> =
            self.indexes.read().connections.values().cloned().collect();
        tracing::info!(connections = snapshot.len(), "closing registry");
        for conn in snapshot {
            conn.terminate(CLOSE_GOING_AWAY, "Server shutting down");
        }

        let mut indexes = self.indexes.write();
        indexes.connections.clear();
        indexes.rooms.clear();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}
