//! The built-in room protocol every connection speaks.
//!
//! | Incoming   | Data                    | Effect                                     |
//! |------------|-------------------------|--------------------------------------------|
//! | `join`     | `{room}`                | join the room, reply `joined`              |
//! | `leave`    | `{room}`                | leave the room, reply `left`               |
//! | `say`      | `{room, payload}`       | members only: broadcast `message` to room  |
//! | `identify` | `{id}`                  | rename the connection, reply `identity`    |
//! | `whoami`   | none                    | reply `identity` with id, rooms, query     |
//!
//! Rejected messages are answered with an `error` event.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::handler::{handler, reject, HandlerError, HandlerResult};
use crate::gateway::registry::RegistryOptions;
use crate::gateway::transport::CloseInfo;
use crate::gateway::Connection;

pub mod events {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const SAY: &str = "say";
    pub const IDENTIFY: &str = "identify";
    pub const WHOAMI: &str = "whoami";

    pub const JOINED: &str = "joined";
    pub const LEFT: &str = "left";
    pub const MESSAGE: &str = "message";
    pub const IDENTITY: &str = "identity";
    pub const ERROR: &str = "error";
}

use events::*;

#[derive(Debug, Deserialize)]
struct RoomPayload {
    room: String,
}

#[derive(Debug, Deserialize)]
struct SayPayload {
    room: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct IdentifyPayload {
    id: String,
}

/// Registry options wiring the room protocol, error replies, and close logging.
pub fn registry_options(config: &Config) -> RegistryOptions {
    RegistryOptions::default()
        .with_heartbeat_interval(config.heartbeat_interval)
        .on_connection(install)
        .on_error(report_error)
        .on_close(log_close)
}

pub fn install(conn: &Arc<Connection>) {
    conn.on(JOIN, on_join);
    conn.on(LEAVE, on_leave);
    conn.on_s(SAY, [handler(require_membership), handler(on_say)]);
    conn.on(IDENTIFY, on_identify);
    conn.on(WHOAMI, on_whoami);
}

pub fn report_error(conn: &Connection, err: &GatewayError) {
    tracing::warn!(conn_id = %conn.id(), error = %err, "connection error");
    if let Err(send_err) = conn.emit_s(ERROR, json!({ "message": err.to_string() })) {
        tracing::debug!(conn_id = %conn.id(), error = %send_err, "could not report error to peer");
    }
}

fn log_close(conn: &Connection, info: Option<&CloseInfo>) {
    tracing::info!(
        conn_id = %conn.id(),
        code = info.map(|i| i.code),
        reason = info.map(|i| i.reason.as_str()).unwrap_or_default(),
        "peer disconnected"
    );
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, HandlerError> {
    serde_json::from_value(data).map_err(|e| HandlerError::new(format!("invalid payload: {e}")))
}

fn reply(conn: &Connection, event: &str, data: Value) -> HandlerResult {
    conn.emit_s(event, data)
        .map_err(|e| HandlerError::new(e.to_string()))
}

async fn on_join(conn: Arc<Connection>, data: Value) -> HandlerResult {
    let RoomPayload { room } = parse(data)?;
    conn.join(&room);
    reply(&conn, JOINED, json!({ "room": room }))
}

async fn on_leave(conn: Arc<Connection>, data: Value) -> HandlerResult {
    let RoomPayload { room } = parse(data)?;
    conn.leave(&room);
    reply(&conn, LEFT, json!({ "room": room }))
}

async fn require_membership(conn: Arc<Connection>, data: Value) -> HandlerResult {
    let RoomPayload { room } = parse(data)?;
    if !conn.in_room(&room) {
        return reject(format!("not a member of `{room}`"));
    }
    Ok(())
}

async fn on_say(conn: Arc<Connection>, data: Value) -> HandlerResult {
    let SayPayload { room, payload } = parse(data)?;
    let registry = conn
        .registry()
        .ok_or_else(|| HandlerError::new("gateway is shutting down"))?;
    registry.to_rooms([room.as_str()]).emit_s(
        MESSAGE,
        json!({ "room": room, "from": conn.id(), "payload": payload }),
    );
    Ok(())
}

async fn on_identify(conn: Arc<Connection>, data: Value) -> HandlerResult {
    let IdentifyPayload { id } = parse(data)?;
    if id.is_empty() {
        return reject("id must not be empty");
    }
    if !conn.set_id(id.as_str()) {
        return reject(format!("id `{id}` is already in use"));
    }
    reply(&conn, IDENTITY, json!({ "id": id }))
}

async fn on_whoami(conn: Arc<Connection>, _data: Value) -> HandlerResult {
    let mut rooms: Vec<String> = conn.rooms().into_iter().collect();
    rooms.sort();
    reply(
        &conn,
        IDENTITY,
        json!({
            "id": conn.id(),
            "rooms": rooms,
            "query": conn.query(),
            "auth": conn.auth_data(),
        }),
    )
}
