//! WebRTC signaling relay for peer-to-peer video rooms. Media never passes
//! through the server; only offers, answers and ICE candidates do.

pub mod handler;
pub mod hub;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repo::UserId;

pub use hub::VideoChatHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Join,
    Leave,
    Offer,
    Answer,
    #[serde(rename = "ice-candidate")]
    IceCandidate,
    RoomUsers,
    UserJoined,
    UserLeft,
    Error,
    ServerShutdown,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SignalKind {
    /// Point-to-point negotiation messages that need a `target_id`.
    pub fn is_negotiation(self) -> bool {
        matches!(self, SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate)
    }
}

/// One signaling frame, in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type", default)]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Signal {
    pub fn new(kind: SignalKind, room_id: impl Into<String>) -> Self {
        Self {
            kind,
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn from_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(kind = ?self.kind, error = %e, "Failed to serialize signal");
                None
            }
        }
    }
}
