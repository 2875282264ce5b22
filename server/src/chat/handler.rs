use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::hub::ChatHub;
use super::presence::RoomPresenceAction;
use crate::auth::ratelimit::{self, RateLimiter};
use crate::notify::Notifier;
use crate::repo::{ChatRepository, Conversation, ConversationId, MessageType, NewMessage, User};
use crate::state::AppState;
use crate::ws::client::{self, Client, MessageHandler};
use crate::ws::handler::{admit, refuse, reject_socket, Admission, WsAuthQuery};
use crate::ws::protocol::{Envelope, EventKind};

/// Frames a chat client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatCommand {
    Join {
        conversation_id: ConversationId,
    },
    Leave {
        conversation_id: ConversationId,
    },
    Typing {
        conversation_id: ConversationId,
        #[serde(default)]
        is_typing: bool,
    },
    Message {
        conversation_id: ConversationId,
        #[serde(default)]
        content: String,
    },
    Read {
        conversation_id: ConversationId,
    },
    #[serde(other)]
    Unknown,
}

/// Per-connection chat protocol handler.
pub struct ChatSession {
    user: User,
    hub: Arc<ChatHub>,
    notifier: Arc<Notifier>,
    chats: Arc<dyn ChatRepository>,
    limiter: Arc<RateLimiter>,
}

impl ChatSession {
    pub fn new(
        user: User,
        hub: Arc<ChatHub>,
        notifier: Arc<Notifier>,
        chats: Arc<dyn ChatRepository>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            user,
            hub,
            notifier,
            chats,
            limiter,
        }
    }

    fn rate_identity(&self) -> String {
        format!("user:{}", self.user.id)
    }

    async fn is_participant(&self, conversation_id: ConversationId) -> bool {
        match self.chats.is_user_participant(self.user.id, conversation_id).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::debug!(user_id = self.user.id, conversation_id, error = %e, "Participant check failed");
                false
            }
        }
    }

    async fn participant_conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        match self.chats.get_conversation(conversation_id).await {
            Ok(conversation) if conversation.has_participant(self.user.id) => Some(conversation),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(user_id = self.user.id, conversation_id, error = %e, "Conversation lookup failed");
                None
            }
        }
    }

    fn reply(&self, client: &Client, envelope: &Envelope) {
        if let Some(frame) = envelope.to_frame() {
            client.try_send(frame);
        }
    }

    pub async fn handle(&self, client: &Arc<Client>, command: ChatCommand) {
        let user_id = self.user.id;
        match command {
            ChatCommand::Join { conversation_id } => {
                let Some(conversation) = self.participant_conversation(conversation_id).await else {
                    return;
                };
                if !self.hub.join_conversation(user_id, conversation_id) {
                    return;
                }
                self.notifier
                    .publish_presence(conversation_id, user_id, &self.user.username, "online")
                    .await;
                let joined = Envelope::new(
                    EventKind::Joined,
                    json!({ "conversation_id": conversation_id }),
                )
                .conversation(conversation_id);
                self.reply(client, &joined);
                if conversation.is_group {
                    self.hub.chatroom_presence(
                        &conversation,
                        user_id,
                        &self.user.username,
                        RoomPresenceAction::JoinedRoom,
                    );
                }
            }
            ChatCommand::Leave { conversation_id } => {
                let was_active = self.hub.is_user_active(user_id, conversation_id);
                self.hub.leave_conversation(user_id, conversation_id);
                if !was_active {
                    return;
                }
                self.notifier
                    .publish_presence(conversation_id, user_id, &self.user.username, "offline")
                    .await;
                if let Some(conversation) = self.participant_conversation(conversation_id).await {
                    if conversation.is_group {
                        self.hub.chatroom_presence(
                            &conversation,
                            user_id,
                            &self.user.username,
                            RoomPresenceAction::LeftRoom,
                        );
                    }
                }
            }
            ChatCommand::Typing {
                conversation_id,
                is_typing,
            } => {
                if !self.is_participant(conversation_id).await {
                    return;
                }
                if !self.limiter.allow(ratelimit::TYPING, &self.rate_identity()).await {
                    return;
                }
                self.notifier
                    .publish_typing(conversation_id, user_id, &self.user.username, is_typing)
                    .await;
            }
            ChatCommand::Message {
                conversation_id,
                content,
            } => self.send_message(client, conversation_id, content).await,
            ChatCommand::Read { conversation_id } => {
                if !self.is_participant(conversation_id).await {
                    return;
                }
                if let Err(e) = self.chats.update_last_read(conversation_id, user_id).await {
                    tracing::warn!(user_id, conversation_id, error = %e, "Failed to update last read");
                }
                let read = Envelope::new(
                    EventKind::Read,
                    json!({ "conversation_id": conversation_id, "user_id": user_id }),
                )
                .conversation(conversation_id)
                .user(user_id)
                .username(self.user.username.clone());
                self.notifier.publish_chat_message(conversation_id, &read).await;
            }
            ChatCommand::Unknown => {
                tracing::debug!(user_id, "Ignoring unknown chat frame type");
            }
        }
    }

    async fn send_message(&self, client: &Arc<Client>, conversation_id: ConversationId, content: String) {
        let user_id = self.user.id;
        if content.trim().is_empty() {
            return;
        }
        let Some(conversation) = self.participant_conversation(conversation_id).await else {
            return;
        };

        if !self.limiter.allow(ratelimit::SEND_CHAT, &self.rate_identity()).await {
            self.reply(client, &Envelope::error("Rate limit exceeded. Please wait a moment."));
            return;
        }

        let message = match self
            .chats
            .create_message(NewMessage {
                conversation_id,
                sender_id: user_id,
                content,
                message_type: MessageType::Text,
            })
            .await
        {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(user_id, conversation_id, error = %e, "Failed to store message");
                self.reply(client, &Envelope::error("Failed to send message"));
                return;
            }
        };

        let mut payload = json!(message);
        payload["sender"] = json!(self.user);
        let envelope = Envelope::new(EventKind::Message, payload)
            .conversation(conversation_id)
            .user(user_id)
            .username(self.user.username.clone());

        self.notifier.publish_chat_message(conversation_id, &envelope).await;

        if conversation.is_group {
            let room_message = Envelope {
                kind: EventKind::RoomMessage,
                ..envelope
            };
            self.hub.broadcast_to_conversation(conversation_id, &room_message);
        } else {
            for recipient in conversation.participant_ids().filter(|&id| id != user_id) {
                self.notifier.publish_user(recipient, &envelope).await;
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ChatSession {
    async fn on_message(&self, client: &Arc<Client>, raw: &[u8]) {
        match serde_json::from_slice::<ChatCommand>(raw) {
            Ok(command) => self.handle(client, command).await,
            Err(e) => {
                tracing::warn!(user_id = self.user.id, error = %e, "Invalid chat frame");
            }
        }
    }
}

/// GET /api/ws/chat
pub async fn chat_ws(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match admit(&state, &query, &headers).await {
        Ok(admission) => ws.on_upgrade(move |socket| run_chat_socket(state, admission, socket)),
        Err(e) => refuse("chat", e),
    }
}

async fn run_chat_socket(state: AppState, admission: Admission, socket: WebSocket) {
    let user = admission.user.clone();
    let (client, outbound) = match state.chat_hub.register(user.id) {
        Ok(registered) => registered,
        Err(e) => return reject_socket(socket, e).await,
    };
    admission.release(&state.tickets);

    let welcome = Envelope::new(
        EventKind::Connected,
        json!({ "user_id": user.id, "username": user.username }),
    );
    if let Some(frame) = welcome.to_frame() {
        client.try_send(frame);
    }

    let session = Arc::new(ChatSession::new(
        user.clone(),
        state.chat_hub.clone(),
        state.notifier.clone(),
        state.chats.clone(),
        state.rate_limiter.clone(),
    ));
    client::serve(socket, client, outbound, session, state.chat_hub.clone()).await;

    if !state.chat_hub.is_user_online(user.id) {
        announce_offline(&state, &user).await;
    }
}

/// After a user's last connection closes, tell every group they belong to.
async fn announce_offline(state: &AppState, user: &User) {
    let conversations = match state.chats.group_conversations_for(user.id).await {
        Ok(conversations) => conversations,
        Err(e) => {
            tracing::warn!(user_id = user.id, error = %e, "Failed to load group conversations");
            return;
        }
    };
    for conversation in conversations {
        state.chat_hub.leave_conversation(user.id, conversation.id);
        state
            .chat_hub
            .chatroom_presence(&conversation, user.id, &user.username, RoomPresenceAction::Offline);
    }
}
