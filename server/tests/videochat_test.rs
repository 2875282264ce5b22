//! Integration tests for the video signaling socket.

mod common;

use serde_json::json;

use common::*;

#[tokio::test]
async fn room_parameter_is_required() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");
    let ticket = server.ticket_for(1).await;

    let url = format!("{}/api/ws/videochat?ticket={}", server.ws_url, ticket);
    match tokio_tungstenite::connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 400),
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn peers_negotiate_through_the_hub() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");
    server.users.insert(2, "bob");

    let mut alice = server.connect(1, "/api/ws/videochat", "room=standup").await;
    assert!(eventually(|| server.state.video_hub.peers("standup") == vec![1]).await);
    let roster = next_of_type(&mut alice, "room_users").await;
    assert_eq!(roster["payload"]["users"], json!([]));

    let mut bob = server.connect(2, "/api/ws/videochat", "room=standup").await;
    let roster = next_of_type(&mut bob, "room_users").await;
    assert_eq!(roster["payload"]["users"][0]["userId"], 1);
    let joined = next_of_type(&mut alice, "user_joined").await;
    assert_eq!(joined["user_id"], 2);
    assert_eq!(joined["username"], "bob");

    send_json(
        &mut bob,
        json!({"type": "offer", "target_id": 1, "payload": {"sdp": "v=0"}}),
    )
    .await;
    let offer = next_of_type(&mut alice, "offer").await;
    assert_eq!(offer["user_id"], 2);
    assert_eq!(offer["room_id"], "standup");
    assert_eq!(offer["payload"]["sdp"], "v=0");

    send_json(
        &mut alice,
        json!({"type": "ice-candidate", "target_id": 2, "payload": {"candidate": "c"}}),
    )
    .await;
    let candidate = next_of_type(&mut bob, "ice-candidate").await;
    assert_eq!(candidate["user_id"], 1);
}

#[tokio::test]
async fn negotiation_without_target_is_refused() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");

    let mut alice = server.connect(1, "/api/ws/videochat", "room=solo").await;
    next_of_type(&mut alice, "room_users").await;

    send_json(&mut alice, json!({"type": "answer", "payload": {"sdp": "v=0"}})).await;
    let error = next_of_type(&mut alice, "error").await;
    assert_eq!(error["payload"]["message"], "target_id required");
}

#[tokio::test]
async fn leave_closes_only_that_peer() {
    let server = start_test_server().await;
    server.users.insert(1, "alice");
    server.users.insert(2, "bob");

    let mut alice = server.connect(1, "/api/ws/videochat", "room=standup").await;
    next_of_type(&mut alice, "room_users").await;
    let mut bob = server.connect(2, "/api/ws/videochat", "room=standup").await;
    next_of_type(&mut bob, "room_users").await;
    next_of_type(&mut alice, "user_joined").await;

    send_json(&mut bob, json!({"type": "leave"})).await;
    let left = next_of_type(&mut alice, "user_left").await;
    assert_eq!(left["user_id"], 2);
    assert!(eventually(|| server.state.video_hub.peers("standup") == vec![1]).await);
}
