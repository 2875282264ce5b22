//! Collaborator interfaces for the relational side of the platform.
//!
//! The realtime layer never owns persistence; it reads and writes through
//! these traits. In-memory implementations live in [`memory`].

pub mod memory;
pub mod models;

use async_trait::async_trait;

pub use memory::{MemoryChatRepository, MemoryGameRepository, MemoryUserRepository};
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("repository backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: UserId) -> Result<User, RepoError>;
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<Message, RepoError>;

    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, RepoError>;

    async fn is_user_participant(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, RepoError> {
        let conversation = self.get_conversation(conversation_id).await?;
        Ok(conversation.has_participant(user_id))
    }

    async fn update_last_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<(), RepoError>;

    /// Group conversations the user takes part in.
    async fn group_conversations_for(&self, user_id: UserId) -> Result<Vec<Conversation>, RepoError>;
}

#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn get_room(&self, id: RoomId) -> Result<GameRoom, RepoError>;

    /// Persist every field of `room` and bump `updated_at`.
    async fn update_room(&self, room: &GameRoom) -> Result<GameRoom, RepoError>;

    async fn create_room(&self, room: NewGameRoom) -> Result<GameRoom, RepoError>;

    /// Pending and Active rooms, newest first, optionally filtered by type.
    async fn get_active_rooms(&self, game_type: Option<GameType>) -> Result<Vec<GameRoom>, RepoError>;
}
