use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use roomcast_common::Envelope;
use roomcast_gateway::config::Config;
use roomcast_gateway::gateway::registry::Registry;
use roomcast_gateway::gateway::upgrade::{Authenticator, StaticTokenAuthenticator};
use roomcast_gateway::GatewayState;

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config with a long heartbeat so it never interferes unless a test asks for it.
pub fn test_config() -> Config {
    Config {
        port: 0,
        gateway_path: "/ws".to_string(),
        heartbeat_interval: Duration::from_secs(60),
        gateway_token: None,
    }
}

pub fn test_state(config: Config) -> GatewayState {
    let registry = Registry::new(roomcast_gateway::app::registry_options(&config));
    let authenticator = config
        .gateway_token
        .as_ref()
        .map(|token| Arc::new(StaticTokenAuthenticator::new(token.clone())) as Arc<dyn Authenticator>);
    GatewayState {
        registry,
        authenticator,
        config: Arc::new(config),
    }
}

/// Start a real TCP server in the background.
pub async fn start_server(config: Config) -> (SocketAddr, GatewayState) {
    let state = test_state(config);
    let app = roomcast_gateway::routes::router(&state.config.gateway_path).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

pub async fn connect(addr: SocketAddr, query: &str) -> Socket {
    let url = format!("ws://{addr}/ws{query}");
    let (socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    socket
}

pub async fn send(socket: &mut Socket, event: &str, data: Value) {
    let text = Envelope::new(event, data).encode().unwrap();
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("ws send");
}

/// Next envelope from the server, skipping heartbeat traffic.
pub async fn recv(socket: &mut Socket) -> Envelope {
    loop {
        let msg = time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws read error");
        if let Message::Text(text) = msg {
            if text.as_str() == roomcast_common::PING {
                continue;
            }
            return Envelope::decode(text.as_str()).expect("decode envelope");
        }
    }
}

/// Assert nothing but heartbeat traffic arrives within `window`.
pub async fn assert_silent(socket: &mut Socket, window: Duration) {
    let deadline = time::Instant::now() + window;
    loop {
        match time::timeout_at(deadline, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) if text.as_str() == roomcast_common::PING => {}
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn next_close_code(socket: &mut Socket) -> Option<u16> {
    time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timeout waiting for close")
}

/// Poll until `check` holds or a couple of seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
