//! Two hub processes sharing one store: presence and notifications cross
//! the node boundary.

mod common;

use serde_json::json;

use common::*;
use realtime_hub::state::Backend;
use realtime_hub::store::MemoryStore;
use realtime_hub::ws::protocol::{Envelope, EventKind};

async fn cluster() -> (TestServer, TestServer) {
    let shared = MemoryStore::new();
    let a = start_node(Backend::shared_memory(shared.clone()), "node-a").await;
    let b = start_node(Backend::shared_memory(shared), "node-b").await;
    for node in [&a, &b] {
        node.users.insert(1, "alice");
        node.users.insert(2, "bob");
    }
    (a, b)
}

#[tokio::test]
async fn online_status_is_mirrored_across_nodes() {
    let (a, b) = cluster().await;

    let mut watcher = b.connect(2, "/api/ws/chat", "").await;
    next_of_type(&mut watcher, "connected").await;

    let mut socket = a.connect(1, "/api/ws", "").await;
    next_of_type(&mut socket, "connected").await;
    assert!(eventually(|| b.state.presence.is_online(1)).await);

    let online = next_of_type(&mut watcher, "user_status").await;
    assert_eq!(online["user_id"], 1);
    assert_eq!(online["payload"]["status"], "online");

    socket.close(None).await.unwrap();
    assert!(eventually(|| !b.state.presence.is_online(1)).await);
    let offline = next_of_type(&mut watcher, "user_status").await;
    assert_eq!(offline["payload"]["status"], "offline");
}

#[tokio::test]
async fn remote_report_never_overrides_local_connection() {
    let (a, b) = cluster().await;

    let mut local = b.connect(1, "/api/ws", "").await;
    let mut remote = a.connect(1, "/api/ws", "").await;
    next_of_type(&mut local, "connected").await;
    next_of_type(&mut remote, "connected").await;

    remote.close(None).await.unwrap();
    assert!(eventually(|| a.state.presence.local_connections(1) == 0).await);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(b.state.presence.is_online(1));
}

#[tokio::test]
async fn user_notification_published_on_one_node_reaches_the_other() {
    let (a, b) = cluster().await;

    let mut socket = b.connect(1, "/api/ws", "").await;
    next_of_type(&mut socket, "connected").await;

    let note = Envelope::new(EventKind::Message, json!({"text": "from a"})).user(1);
    a.state.notifier.publish_user(1, &note).await;

    let got = next_of_type(&mut socket, "message").await;
    assert_eq!(got["payload"]["text"], "from a");
}
