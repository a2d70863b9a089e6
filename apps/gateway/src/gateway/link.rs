//! An addressable set of connections.
//!
//! A [`Link`] is built by the registry's selectors (`to_clients`, `to_rooms`,
//! `to_all`, `filter`) from a snapshot of matching connections and lives only as
//! long as the call chain using it. Every operation fans out per target; one
//! target failing never stops the others.

use std::sync::Arc;

use roomcast_common::Envelope;
use serde_json::Value;

use super::connection::Connection;
use super::registry::Registry;

pub struct Link<'a> {
    registry: &'a Registry,
    targets: Vec<Arc<Connection>>,
}

impl<'a> Link<'a> {
    pub(crate) fn new(registry: &'a Registry, targets: Vec<Arc<Connection>>) -> Self {
        Self { registry, targets }
    }

    /// Put every target into `room`. Targets already there are left alone.
    pub fn join(&self, room: &str) -> &Self {
        for conn in &self.targets {
            self.add_client_to_room(conn, room);
        }
        self
    }

    /// Put one connection, not necessarily a target, into `room`.
    pub fn add_client_to_room(&self, conn: &Arc<Connection>, room: &str) -> &Self {
        if self.registry.indexes.write().attach(conn, room) {
            tracing::debug!(conn_id = %conn.id(), %room, "joined room");
        }
        self
    }

    pub fn leave(&self, room: &str) -> &Self {
        for conn in &self.targets {
            self.remove_client_in_room(conn, &[room]);
        }
        self
    }

    /// Take one connection out of each named room. Rooms left empty are deleted.
    pub fn remove_client_in_room<S: AsRef<str>>(&self, conn: &Connection, rooms: &[S]) -> &Self {
        let mut indexes = self.registry.indexes.write();
        for room in rooms {
            let room = room.as_ref();
            if indexes.detach(conn, room) {
                tracing::debug!(conn_id = %conn.id(), %room, "left room");
            }
        }
        self
    }

    /// Send one envelope to every target.
    pub fn emit_s(&self, event: &str, data: Value) -> &Self {
        let text = match Envelope::new(event, data).encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%event, error = %err, "failed to serialize event");
                return self;
            }
        };

        let mut delivered = 0usize;
        for conn in &self.targets {
            match conn.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(conn_id = %conn.id(), %event, error = %err, "failed to deliver event");
                }
            }
        }
        tracing::trace!(%event, recipients = self.targets.len(), delivered, "emitted event");
        self
    }

    /// Start the close handshake on every target.
    pub fn close(&self) -> &Self {
        for conn in &self.targets {
            conn.close();
        }
        self
    }

    /// Number of targets in this link.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the selection matched no connections.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Current ids of the targets, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.targets.iter().map(|c| c.id()).collect()
    }

    /// The targeted connections themselves.
    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::{ConnectionInit, ConnectionState};
    use crate::gateway::query::QueryParams;
    use crate::gateway::registry::RegistryOptions;
    use crate::gateway::transport::{self, Frame, FrameReceiver};
    use serde_json::json;

    fn connect(registry: &Arc<Registry>) -> (Arc<Connection>, FrameReceiver) {
        let (frames, rx) = transport::channel();
        let conn = registry
            .create_connection(ConnectionInit {
                query: QueryParams::default(),
                auth_data: None,
                frames,
            })
            .unwrap();
        (conn, rx)
    }

    #[test]
    fn link_join_updates_both_sides() {
        let registry = Registry::new(RegistryOptions::default());
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);

        registry.to_all().join("lobby").join("lobby");
        assert!(a.in_room("lobby"));
        assert!(b.in_room("lobby"));
        assert_eq!(registry.room_members("lobby").len(), 2);

        registry.to_clients([a.id()]).leave("lobby");
        assert!(!a.in_room("lobby"));
        assert_eq!(registry.room_members("lobby"), vec![b.id()]);
    }

    #[test]
    fn add_and_remove_outside_connection() {
        let registry = Registry::new(RegistryOptions::default());
        let (a, _ra) = connect(&registry);
        let (b, _rb) = connect(&registry);

        let link = registry.to_clients([a.id()]);
        link.add_client_to_room(&b, "side");
        assert!(b.in_room("side"));
        assert!(!a.in_room("side"));

        b.join("other");
        link.remove_client_in_room(&b, &["side", "other", "never"]);
        assert!(b.rooms().is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn emit_skips_broken_targets() {
        let registry = Registry::new(RegistryOptions::default());
        let (_a, ra) = connect(&registry);
        let (_b, mut rb) = connect(&registry);
        drop(ra);

        registry.to_all().emit_s("news", json!({"n": 1}));

        match rb.try_recv() {
            Ok(Frame::Text(text)) => {
                assert_eq!(Envelope::decode(&text).unwrap().data, json!({"n": 1}));
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn close_starts_handshake_on_each_target() {
        let registry = Registry::new(RegistryOptions::default());
        let (a, mut ra) = connect(&registry);
        let (b, _rb) = connect(&registry);
        a.join("doomed");

        registry.to_rooms(["doomed"]).close();
        assert_eq!(a.state(), ConnectionState::Closing);
        assert_eq!(b.state(), ConnectionState::Open);
        assert!(matches!(ra.try_recv(), Ok(Frame::Close { .. })));
    }
}
