//! Shared harness: a real server on a random port backed by in-memory
//! repositories, plus small WebSocket helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use realtime_hub::config::Config;
use realtime_hub::repo::{MemoryChatRepository, MemoryGameRepository, MemoryUserRepository, UserId};
use realtime_hub::state::{AppState, Backend, Repositories};

pub const TEST_SECRET: &str = "integration-test-secret";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub base_url: String,
    pub ws_url: String,
    pub state: AppState,
    pub users: Arc<MemoryUserRepository>,
    pub chats: Arc<MemoryChatRepository>,
    pub games: Arc<MemoryGameRepository>,
    pub cancel: CancellationToken,
}

/// Helper: start the server on a random port with a private in-memory store.
pub async fn start_test_server() -> TestServer {
    start_node(Backend::memory(), "node-a").await
}

/// Start one node of a cluster; nodes sharing a backend see each other's events.
pub async fn start_node(backend: Backend, node_id: &str) -> TestServer {
    let config = Config {
        jwt_secret: Some(TEST_SECRET.to_string()),
        node_id: Some(node_id.to_string()),
        environment: "test".to_string(),
        ..Config::default()
    };

    let users = Arc::new(MemoryUserRepository::new());
    let chats = Arc::new(MemoryChatRepository::new());
    let games = Arc::new(MemoryGameRepository::new());
    let repos = Repositories {
        users: users.clone(),
        chats: chats.clone(),
        games: games.clone(),
    };

    let state = AppState::new(config, backend, repos);
    let cancel = CancellationToken::new();
    state
        .start_background(cancel.clone())
        .await
        .expect("Failed to wire hubs");

    let app = realtime_hub::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        ws_url: format!("ws://{addr}"),
        state,
        users,
        chats,
        games,
        cancel,
    }
}

impl TestServer {
    pub fn token_for(&self, user_id: UserId) -> String {
        realtime_hub::auth::jwt::issue_access_token(
            TEST_SECRET.as_bytes(),
            user_id,
            Duration::from_secs(900),
        )
        .expect("Failed to issue token")
    }

    /// POST /api/ws/ticket with a bearer token.
    pub async fn ticket_for(&self, user_id: UserId) -> String {
        let resp = reqwest::Client::new()
            .post(format!("{}/api/ws/ticket", self.base_url))
            .bearer_auth(self.token_for(user_id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["ticket"].as_str().expect("ticket in body").to_string()
    }

    /// Open `path` (with an optional extra query) using a fresh ticket.
    pub async fn connect(&self, user_id: UserId, path: &str, query: &str) -> Socket {
        let ticket = self.ticket_for(user_id).await;
        let sep = if query.is_empty() { "" } else { "&" };
        let url = format!("{}{}?{}{}ticket={}", self.ws_url, path, query, sep, ticket);
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("WebSocket connect failed");
        socket
    }

    /// Open `path` with an `Authorization: Bearer` header instead of a ticket.
    pub async fn connect_with_bearer(&self, user_id: UserId, path: &str) -> Socket {
        let mut request = format!("{}{}", self.ws_url, path).into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.token_for(user_id)).parse().unwrap(),
        );
        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("WebSocket connect failed");
        socket
    }
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Socket closed")
            .expect("Socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("Frame is not JSON");
        }
    }
}

/// Read frames until one of `kind` arrives.
pub async fn next_of_type(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let frame = next_json(socket).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Assert that no frame of `kind` arrives within `wait`.
pub async fn assert_no_frame_of_type(socket: &mut Socket, kind: &str, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, socket.next()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_ne!(frame["type"], kind, "unexpected frame: {frame}");
            }
            Ok(Some(_)) => {}
        }
    }
}

pub async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("Send failed");
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
