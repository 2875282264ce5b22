//! Global user status and per-conversation presence snapshots.

use serde_json::json;

use super::hub::ChatHub;
use crate::repo::{Conversation, User, UserId};
use crate::ws::protocol::{Envelope, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Online,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Why a conversation's presence snapshot is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPresenceAction {
    JoinedRoom,
    LeftRoom,
    Offline,
}

impl RoomPresenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinedRoom => "joined_room",
            Self::LeftRoom => "left_room",
            Self::Offline => "offline",
        }
    }
}

/// Participants of `conversation` that are currently online, in participant order.
pub fn online_participants(hub: &ChatHub, conversation: &Conversation) -> Vec<UserId> {
    conversation
        .participant_ids()
        .filter(|&id| hub.is_user_online(id))
        .collect()
}

pub fn chatroom_presence_envelope(
    hub: &ChatHub,
    conversation: &Conversation,
    actor: UserId,
    username: &str,
    action: RoomPresenceAction,
) -> Envelope {
    let participants: Vec<&User> = conversation.participants.iter().collect();
    Envelope::new(
        EventKind::ChatroomPresence,
        json!({
            "conversation_id": conversation.id,
            "user_id": actor,
            "username": username,
            "action": action.as_str(),
            "participants": participants,
            "member_count": conversation.participants.len(),
            "online_user_ids": online_participants(hub, conversation),
        }),
    )
    .conversation(conversation.id)
    .user(actor)
    .username(username)
}
