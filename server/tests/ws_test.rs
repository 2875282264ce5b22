//! Integration tests for WebSocket admission and the notification socket.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio_tungstenite::tungstenite::Error as WsError;

use common::*;
use realtime_hub::ws::protocol::{Envelope, EventKind};

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(resp) => resp.status().as_u16(),
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = start_test_server().await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "node-a");
    for hub in ["notifications", "chat", "game", "videochat"] {
        assert_eq!(body["connections"][hub], 0, "{hub}");
    }
}

#[tokio::test]
async fn ticket_requires_bearer_token() {
    let server = start_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/ws/ticket", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn ticket_admits_and_welcomes() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let mut socket = server.connect(1, "/api/ws", "").await;
    let welcome = next_of_type(&mut socket, "connected").await;
    assert_eq!(welcome["payload"]["user_id"], 1);
    assert_eq!(welcome["payload"]["username"], "alice");
    assert!(eventually(|| server.state.presence.is_online(1)).await);
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let server = start_test_server().await;
    server.users.insert(2, "bob");

    let mut socket = server.connect_with_bearer(2, "/api/ws").await;
    next_of_type(&mut socket, "connected").await;
}

#[tokio::test]
async fn token_in_query_is_rejected() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let url = format!("{}/api/ws?token={}", server.ws_url, server.token_for(1));
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    assert_eq!(http_status(err), 400);
}

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let server = start_test_server().await;
    let err = tokio_tungstenite::connect_async(format!("{}/api/ws", server.ws_url))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn unknown_ticket_is_rejected() {
    let server = start_test_server().await;
    let url = format!("{}/api/ws?ticket={}", server.ws_url, "ab".repeat(32));
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn released_ticket_cannot_be_replayed() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let ticket = server.ticket_for(1).await;
    let url = format!("{}/api/ws?ticket={}", server.ws_url, ticket);
    let (mut socket, _) = tokio_tungstenite::connect_async(url.clone()).await.unwrap();
    next_of_type(&mut socket, "connected").await;

    // Registration releases the node-local grace entry.
    assert!(eventually(|| server.state.tickets.cached_count() == 0).await);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    assert_eq!(http_status(err), 401);
}

#[tokio::test]
async fn consumed_ticket_revalidates_within_grace() {
    let server = start_test_server().await;
    let ticket = server.state.tickets.issue_ticket(5).await.unwrap();

    assert_eq!(server.state.tickets.consume(&ticket).await.unwrap(), 5);
    // Second pass of a multi-pass upgrade.
    assert_eq!(server.state.tickets.consume(&ticket).await.unwrap(), 5);
}

#[tokio::test]
async fn per_user_notifications_reach_every_tab() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");
    server.users.insert(2, "bob");

    let mut tab_a = server.connect(1, "/api/ws", "").await;
    let mut tab_b = server.connect(1, "/api/ws", "").await;
    let mut other = server.connect(2, "/api/ws", "").await;
    next_of_type(&mut tab_a, "connected").await;
    next_of_type(&mut tab_b, "connected").await;
    next_of_type(&mut other, "connected").await;

    let note = Envelope::new(EventKind::Message, json!({"text": "hi"})).user(1);
    server.state.notifier.publish_user(1, &note).await;

    assert_eq!(next_of_type(&mut tab_a, "message").await["payload"]["text"], "hi");
    assert_eq!(next_of_type(&mut tab_b, "message").await["payload"]["text"], "hi");
    assert_no_frame_of_type(&mut other, "message", Duration::from_millis(200)).await;
}

#[tokio::test]
async fn broadcast_reaches_everyone() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");
    server.users.insert(2, "bob");

    let mut alice = server.connect(1, "/api/ws", "").await;
    let mut bob = server.connect(2, "/api/ws", "").await;
    next_of_type(&mut alice, "connected").await;
    next_of_type(&mut bob, "connected").await;

    let announcement = Envelope::new(EventKind::Message, json!({"text": "maintenance"}));
    server.state.notifier.publish_broadcast(&announcement).await;

    next_of_type(&mut alice, "message").await;
    next_of_type(&mut bob, "message").await;
}

#[tokio::test]
async fn closing_last_socket_goes_offline() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let mut socket = server.connect(1, "/api/ws", "").await;
    next_of_type(&mut socket, "connected").await;
    assert!(eventually(|| server.state.presence.is_online(1)).await);

    socket.close(None).await.unwrap();
    assert!(eventually(|| !server.state.presence.is_online(1)).await);
}

#[tokio::test]
async fn shutdown_closes_sockets() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let mut socket = server.connect(1, "/api/ws", "").await;
    next_of_type(&mut socket, "connected").await;

    let errors = server.state.shutdown(Duration::from_secs(2)).await;
    assert!(errors.is_empty());
    assert!(eventually(|| !server.state.presence.is_online(1)).await);
}
