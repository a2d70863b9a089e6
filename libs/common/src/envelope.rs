//! The `{event, data}` payload exchanged in both directions over the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Literal text payload used as a liveness probe. Never parsed as an envelope.
pub const PING: &str = "ping";
/// Literal text reply to [`PING`].
pub const PONG: &str = "pong";

/// A named event with an arbitrary JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not a valid envelope: {0}")]
    Decode(String),
    #[error("envelope has no event name")]
    MissingEvent,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse an incoming text payload.
    ///
    /// Fails with [`EnvelopeError::Decode`] when the text is not a JSON object and
    /// with [`EnvelopeError::MissingEvent`] when `event` is absent or not a string.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Decode(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::Decode("expected a JSON object".to_string()));
        };

        let event = match map.remove("event") {
            Some(Value::String(event)) => event,
            _ => return Err(EnvelopeError::MissingEvent),
        };
        let data = map.remove("data").unwrap_or(Value::Null);

        Ok(Self { event, data })
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_full_envelope() {
        let env = Envelope::decode(r#"{"event":"chat","data":{"n":1}}"#).unwrap();
        assert_eq!(env.event, "chat");
        assert_eq!(env.data, json!({"n": 1}));
    }

    #[test]
    fn decode_without_data_yields_null() {
        let env = Envelope::decode(r#"{"event":"hello"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            Envelope::decode("[1,2]"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn decode_requires_event_name() {
        assert!(matches!(
            Envelope::decode(r#"{"data":1}"#),
            Err(EnvelopeError::MissingEvent)
        ));
        assert!(matches!(
            Envelope::decode(r#"{"event":7}"#),
            Err(EnvelopeError::MissingEvent)
        ));
    }

    #[test]
    fn encode_matches_wire_shape() {
        let text = Envelope::new("x", json!({"n": 1})).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "x", "data": {"n": 1}}));
    }
}
