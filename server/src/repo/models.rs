/// Row types shared between the hubs and the repositories.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type ConversationId = u64;
pub type RoomId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// A direct or group conversation with its participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub is_group: bool,
    pub name: Option<String>,
    pub participants: Vec<User>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }

    pub fn participant_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.participants.iter().map(|p| p.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    System,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameType {
    Connect4,
    Othello,
    Checkers,
    Battleship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Pending,
    Active,
    Finished,
    Cancelled,
}

impl GameStatus {
    pub fn is_open(self) -> bool {
        matches!(self, GameStatus::Pending | GameStatus::Active)
    }
}

/// A turn-based game room. `current_state` holds the engine's board as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRoom {
    pub id: RoomId,
    #[serde(rename = "type")]
    pub game_type: GameType,
    pub status: GameStatus,
    pub creator_id: UserId,
    pub opponent_id: Option<UserId>,
    pub winner_id: Option<UserId>,
    pub next_turn_id: Option<UserId>,
    pub is_draw: bool,
    pub current_state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameRoom {
    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.creator_id == user_id || self.opponent_id == Some(user_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewGameRoom {
    pub game_type: GameType,
    pub creator_id: UserId,
    pub current_state: serde_json::Value,
}
