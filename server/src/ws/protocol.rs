//! JSON envelope shared by the notification, chat and game sockets.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::repo::{ConversationId, RoomId, UserId};

/// One outbound text frame. Cheap to clone, so a fanout serializes once.
pub type Frame = Utf8Bytes;

/// Closed set of envelope types. Anything else decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    ConnectedUsers,
    UserStatus,
    Message,
    Joined,
    Typing,
    Read,
    Presence,
    RoomMessage,
    ChatroomPresence,
    GameStarted,
    GameState,
    GameRoomUpdated,
    Chat,
    MessagesDropped,
    ServerShutdown,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            conversation_id: None,
            room_id: None,
            user_id: None,
            username: None,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, json!({ "message": message.into() }))
    }

    pub fn conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn room(mut self, id: RoomId) -> Self {
        self.room_id = Some(id);
        self
    }

    pub fn user(mut self, id: UserId) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(kind = ?self.kind, error = %e, "Failed to serialize envelope");
                None
            }
        }
    }

    pub fn to_frame(&self) -> Option<Frame> {
        self.to_json().map(Frame::from)
    }
}

/// Enqueued when a client's outbound queue overflows.
pub const MESSAGES_DROPPED: &str = r#"{"type":"messages_dropped","payload":{"reason":"buffer_full"}}"#;
