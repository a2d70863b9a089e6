use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use roomcast_common::EnvelopeError;
use thiserror::Error;

/// Failures surfaced to the application's error handler.
///
/// None of these are fatal to the registry or to other connections.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("message has no event name")]
    MissingEvent,
    #[error("handler for `{event}` rejected the message: {reason}")]
    Handler { event: String, reason: String },
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("registry is closed")]
    RegistryClosed,
}

impl From<EnvelopeError> for GatewayError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::Decode(reason) => Self::Decode(reason),
            EnvelopeError::MissingEvent => Self::MissingEvent,
        }
    }
}

/// Rejection raised by an authenticator during the upgrade handshake.
#[derive(Debug, Error)]
#[error("authentication failed: {reason}")]
pub struct AuthenticationError {
    pub reason: String,
}

impl AuthenticationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A rejected upgrade is answered with a bare 401 and no body.
impl IntoResponse for AuthenticationError {
    fn into_response(self) -> Response {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Errors from the typed per-connection variable store.
#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable `{0}` is not set")]
    NotFound(String),
    #[error("variable `{key}` has an unexpected type: {source}")]
    Type {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("variable `{key}` could not be stored: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_errors_map_to_gateway_taxonomy() {
        let decode: GatewayError = EnvelopeError::Decode("bad".into()).into();
        assert!(matches!(decode, GatewayError::Decode(ref r) if r == "bad"));

        let missing: GatewayError = EnvelopeError::MissingEvent.into();
        assert!(matches!(missing, GatewayError::MissingEvent));
    }

    #[test]
    fn authentication_error_is_unauthorized() {
        let resp = AuthenticationError::new("nope").into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
