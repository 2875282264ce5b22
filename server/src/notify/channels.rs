//! Pub/sub channel names.

use crate::repo::{ConversationId, RoomId, UserId};

pub const USER_PREFIX: &str = "notifications:user:";
pub const USER_PATTERN: &str = "notifications:user:*";
pub const BROADCAST: &str = "notifications:broadcast";

pub const CHAT_PREFIX: &str = "chat:conv:";
pub const TYPING_PREFIX: &str = "typing:conv:";
pub const PRESENCE_PREFIX: &str = "presence:conv:";
pub const CHAT_PATTERNS: [&str; 3] = ["chat:conv:*", "typing:conv:*", "presence:conv:*"];

pub const GAME_PREFIX: &str = "game:room:";
pub const GAME_PATTERN: &str = "game:room:*";

pub const VIDEOCHAT_PREFIX: &str = "videochat:room:";
pub const VIDEOCHAT_PATTERN: &str = "videochat:room:*";

/// Node-to-node presence mirroring.
pub const PRESENCE_EVENTS: &str = "presence:events";

pub fn user(id: UserId) -> String {
    format!("{USER_PREFIX}{id}")
}

pub fn conversation(id: ConversationId) -> String {
    format!("{CHAT_PREFIX}{id}")
}

pub fn typing(id: ConversationId) -> String {
    format!("{TYPING_PREFIX}{id}")
}

pub fn presence(id: ConversationId) -> String {
    format!("{PRESENCE_PREFIX}{id}")
}

pub fn game_room(id: RoomId) -> String {
    format!("{GAME_PREFIX}{id}")
}

pub fn videochat_room(room: &str) -> String {
    format!("{VIDEOCHAT_PREFIX}{room}")
}

/// Numeric suffix of `channel` after `prefix`.
pub fn parse_id(channel: &str, prefix: &str) -> Option<u64> {
    channel.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_requires_prefix_and_number() {
        assert_eq!(parse_id(&user(42), USER_PREFIX), Some(42));
        assert_eq!(parse_id("notifications:user:abc", USER_PREFIX), None);
        assert_eq!(parse_id(&conversation(5), TYPING_PREFIX), None);
    }
}
