use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::{Signal, SignalKind, VideoChatHub};
use crate::repo::User;
use crate::state::AppState;
use crate::ws::client::{self, Client, MessageHandler};
use crate::ws::handler::{admit, refuse, reject_socket, WsAuthQuery};
use crate::ws::protocol::Frame;

#[derive(Debug, Default, Deserialize)]
pub struct VideoRoomQuery {
    #[serde(default)]
    pub room: String,
}

struct VideoSession {
    user: User,
    room: String,
    hub: Arc<VideoChatHub>,
}

impl VideoSession {
    fn reply_error(&self, client: &Client, message: &str) {
        let error = Signal::new(SignalKind::Error, self.room.as_str()).with_payload(json!({ "message": message }));
        if let Some(json) = error.to_json() {
            client.try_send(Frame::from(json));
        }
    }
}

#[async_trait]
impl MessageHandler for VideoSession {
    async fn on_message(&self, client: &Arc<Client>, raw: &[u8]) {
        let signal: Signal = match serde_json::from_slice(raw) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(user_id = self.user.id, error = %e, "Invalid video signal");
                return;
            }
        };

        match signal.kind {
            kind if kind.is_negotiation() => {
                let Some(target) = signal.target_id else {
                    tracing::debug!(user_id = self.user.id, ?kind, "Signal missing target_id");
                    self.reply_error(client, "target_id required");
                    return;
                };
                let mut signal = signal;
                signal.username = Some(self.user.username.clone());
                self.hub.relay(&self.room, self.user.id, target, signal).await;
            }
            SignalKind::Leave => {
                self.hub.leave(&self.room, self.user.id).await;
                client.close();
            }
            kind => {
                tracing::debug!(user_id = self.user.id, ?kind, "Ignoring video signal");
            }
        }
    }
}

/// GET /api/ws/videochat?room=
pub async fn videochat_ws(
    State(state): State<AppState>,
    Query(auth): Query<WsAuthQuery>,
    Query(query): Query<VideoRoomQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if query.room.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "room parameter required" })),
        )
            .into_response();
    }
    let admission = match admit(&state, &auth, &headers).await {
        Ok(admission) => admission,
        Err(e) => return refuse("videochat", e),
    };

    ws.on_upgrade(move |socket| async move {
        let user = admission.user.clone();
        let room = query.room;
        let hub = state.video_hub.clone();
        let (client, outbound) = match hub.register(&room, user.id) {
            Ok(registered) => registered,
            Err(e) => return reject_socket(socket, e).await,
        };
        admission.release(&state.tickets);

        hub.broadcast_join(&room, user.id, &user.username).await;
        let session = Arc::new(VideoSession {
            user,
            room,
            hub: hub.clone(),
        });
        client::serve(socket, client, outbound, session, hub).await;
    })
}
