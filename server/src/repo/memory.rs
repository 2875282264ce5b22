use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{
    ChatRepository, Conversation, ConversationId, GameRepository, GameRoom, GameStatus, GameType,
    Message, NewGameRoom, NewMessage, RepoError, RoomId, User, UserId, UserRepository,
};

#[derive(Default)]
pub struct MemoryUserRepository {
    users: DashMap<UserId, User>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: UserId, username: &str) -> User {
        let user = User {
            id,
            username: username.to_string(),
        };
        self.users.insert(id, user.clone());
        user
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get_by_id(&self, id: UserId) -> Result<User, RepoError> {
        self.users
            .get(&id)
            .map(|u| u.clone())
            .ok_or(RepoError::NotFound { entity: "user", id })
    }
}

#[derive(Default)]
pub struct MemoryChatRepository {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
    last_read: DashMap<(ConversationId, UserId), chrono::DateTime<Utc>>,
    next_message_id: AtomicU64,
}

impl MemoryChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.conversations.insert(conversation.id, conversation);
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.messages
            .get(&conversation_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn last_read(&self, conversation_id: ConversationId, user_id: UserId) -> Option<chrono::DateTime<Utc>> {
        self.last_read.get(&(conversation_id, user_id)).map(|t| *t)
    }
}

#[async_trait]
impl ChatRepository for MemoryChatRepository {
    async fn create_message(&self, message: NewMessage) -> Result<Message, RepoError> {
        if !self.conversations.contains_key(&message.conversation_id) {
            return Err(RepoError::NotFound {
                entity: "conversation",
                id: message.conversation_id,
            });
        }
        let stored = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            message_type: message.message_type,
            created_at: Utc::now(),
        };
        self.messages
            .entry(stored.conversation_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, RepoError> {
        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or(RepoError::NotFound {
                entity: "conversation",
                id,
            })
    }

    async fn update_last_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), RepoError> {
        self.last_read.insert((conversation_id, user_id), Utc::now());
        Ok(())
    }

    async fn group_conversations_for(&self, user_id: UserId) -> Result<Vec<Conversation>, RepoError> {
        Ok(self
            .conversations
            .iter()
            .filter(|c| c.is_group && c.has_participant(user_id))
            .map(|c| c.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryGameRepository {
    rooms: DashMap<RoomId, GameRoom>,
    next_room_id: AtomicU64,
}

impl MemoryGameRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a room verbatim, timestamps included.
    pub fn insert_room(&self, room: GameRoom) {
        self.next_room_id.fetch_max(room.id, Ordering::Relaxed);
        self.rooms.insert(room.id, room);
    }
}

#[async_trait]
impl GameRepository for MemoryGameRepository {
    async fn get_room(&self, id: RoomId) -> Result<GameRoom, RepoError> {
        self.rooms
            .get(&id)
            .map(|r| r.clone())
            .ok_or(RepoError::NotFound { entity: "game room", id })
    }

    async fn update_room(&self, room: &GameRoom) -> Result<GameRoom, RepoError> {
        let mut stored = self
            .rooms
            .get_mut(&room.id)
            .ok_or(RepoError::NotFound {
                entity: "game room",
                id: room.id,
            })?;
        *stored = room.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn create_room(&self, room: NewGameRoom) -> Result<GameRoom, RepoError> {
        let now = Utc::now();
        let created = GameRoom {
            id: self.next_room_id.fetch_add(1, Ordering::Relaxed) + 1,
            game_type: room.game_type,
            status: GameStatus::Pending,
            creator_id: room.creator_id,
            opponent_id: None,
            winner_id: None,
            next_turn_id: None,
            is_draw: false,
            current_state: room.current_state,
            created_at: now,
            updated_at: now,
        };
        self.rooms.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_active_rooms(&self, game_type: Option<GameType>) -> Result<Vec<GameRoom>, RepoError> {
        let mut rooms: Vec<GameRoom> = self
            .rooms
            .iter()
            .filter(|r| r.status.is_open())
            .filter(|r| game_type.is_none_or(|t| r.game_type == t))
            .map(|r| r.clone())
            .collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rooms)
    }
}
