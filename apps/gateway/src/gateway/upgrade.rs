//! Handshake interception: query parsing, optional authentication, and the
//! hand-off of upgraded sockets to the registry.

use async_trait::async_trait;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::Value;

use crate::error::AuthenticationError;
use crate::GatewayState;

use super::query::QueryParams;
use super::server;

/// The parts of the upgrade request an authenticator may inspect.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Decides whether an upgrade may proceed.
///
/// The returned value becomes the connection's immutable `auth_data`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &UpgradeRequest,
        query: &QueryParams,
    ) -> Result<Option<Value>, AuthenticationError>;
}

/// Accepts sockets whose `token` query parameter or bearer header matches a
/// shared secret.
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(
        &self,
        request: &UpgradeRequest,
        query: &QueryParams,
    ) -> Result<Option<Value>, AuthenticationError> {
        let bearer = request
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let presented = query.first("token").or(bearer);
        match presented {
            Some(token) if token == self.token => {
                Ok(Some(serde_json::json!({ "scheme": "static-token" })))
            }
            Some(_) => Err(AuthenticationError::new("Invalid token")),
            None => Err(AuthenticationError::new("Missing token")),
        }
    }
}

pub fn router(path: &str) -> Router<GatewayState> {
    Router::new().route(path, get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    uri: Uri,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query = QueryParams::from_pairs(pairs);

    let auth_data = match &state.authenticator {
        Some(authenticator) => {
            let request = UpgradeRequest { uri, headers };
            match authenticator.authenticate(&request, &query).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::debug!(reason = %err.reason, "upgrade rejected");
                    return err.into_response();
                }
            }
        }
        None => None,
    };

    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| server::serve_socket(registry, socket, query, auth_data))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>) -> UpgradeRequest {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(axum::http::header::AUTHORIZATION, auth.parse().unwrap());
        }
        UpgradeRequest {
            uri: Uri::from_static("/ws"),
            headers,
        }
    }

    fn query(token: &str) -> QueryParams {
        QueryParams::from_pairs([("token".to_string(), token.to_string())])
    }

    #[tokio::test]
    async fn static_token_accepts_query_or_header() {
        let auth = StaticTokenAuthenticator::new("s3cret");

        let data = auth.authenticate(&request(None), &query("s3cret")).await.unwrap();
        assert_eq!(data, Some(serde_json::json!({"scheme": "static-token"})));

        let data = auth
            .authenticate(&request(Some("Bearer s3cret")), &QueryParams::default())
            .await
            .unwrap();
        assert!(data.is_some());
    }

    #[tokio::test]
    async fn static_token_rejects_wrong_or_missing() {
        let auth = StaticTokenAuthenticator::new("s3cret");

        let err = auth.authenticate(&request(None), &query("nope")).await.unwrap_err();
        assert_eq!(err.reason, "Invalid token");

        let err = auth
            .authenticate(&request(None), &QueryParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, "Missing token");
    }
}
