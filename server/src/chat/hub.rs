use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::presence::{chatroom_presence_envelope, RoomPresenceAction, UserStatus};
use crate::notify::{channels, Notifier};
use crate::repo::{Conversation, ConversationId, UserId};
use crate::store::StoreError;
use crate::ws::client::{Client, ClientRegistry, Outbound};
use crate::ws::hub::{Hub, HubError, HubLimits};
use crate::ws::presence::ConnectionManager;
use crate::ws::protocol::{Envelope, EventKind};
use crate::ws::ShutdownError;

/// Chat sockets plus the conversations each user currently has open.
///
/// Membership only ever holds users with at least one registered chat
/// client; it is dropped when their last chat socket closes.
pub struct ChatHub {
    hub: Hub,
    conversations: DashMap<ConversationId, HashSet<UserId>>,
    user_conversations: DashMap<UserId, HashSet<ConversationId>>,
}

impl ChatHub {
    /// Build the hub and subscribe it to online/offline transitions.
    pub fn new(presence: Arc<ConnectionManager>, limits: HubLimits) -> Arc<Self> {
        let hub = Arc::new(Self {
            hub: Hub::new("chat", presence.clone(), limits),
            conversations: DashMap::new(),
            user_conversations: DashMap::new(),
        });

        let on_online = Arc::downgrade(&hub);
        let on_offline = Arc::downgrade(&hub);
        presence.add_listener(
            Arc::new(move |user_id| {
                if let Some(hub) = on_online.upgrade() {
                    hub.broadcast_global_status(user_id, UserStatus::Online);
                }
            }),
            Arc::new(move |user_id| {
                if let Some(hub) = on_offline.upgrade() {
                    hub.broadcast_global_status(user_id, UserStatus::Offline);
                }
            }),
        );
        hub
    }

    /// Register a chat socket and queue a snapshot of who else is online.
    pub fn register(&self, user_id: UserId) -> Result<(Arc<Client>, Outbound), HubError> {
        let (client, outbound) = self.hub.register(user_id)?;

        let mut online: Vec<UserId> = self
            .hub
            .presence()
            .online_user_ids()
            .into_iter()
            .filter(|&id| id != user_id)
            .collect();
        online.sort_unstable();
        if !online.is_empty() {
            let snapshot = Envelope::new(EventKind::ConnectedUsers, json!({ "user_ids": online }));
            if let Some(frame) = snapshot.to_frame() {
                client.try_send(frame);
            }
        }
        Ok((client, outbound))
    }

    pub fn remove(&self, client: &Client) {
        let user_id = client.user_id();
        if self.hub.remove(client) && !self.hub.has_clients(user_id) {
            self.drop_memberships(user_id);
        }
    }

    fn drop_memberships(&self, user_id: UserId) {
        let Some((_, conversation_ids)) = self.user_conversations.remove(&user_id) else {
            return;
        };
        for conversation_id in conversation_ids {
            if let Some(mut members) = self.conversations.get_mut(&conversation_id) {
                members.remove(&user_id);
            }
            self.conversations
                .remove_if(&conversation_id, |_, members| members.is_empty());
        }
    }

    /// Returns false (and does nothing) when the user has no chat socket.
    pub fn join_conversation(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        if !self.hub.has_clients(user_id) {
            tracing::debug!(user_id, conversation_id, "Ignoring join from user without a chat connection");
            return false;
        }
        self.conversations
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
        self.user_conversations
            .entry(user_id)
            .or_default()
            .insert(conversation_id);
        tracing::debug!(user_id, conversation_id, "Joined conversation");
        true
    }

    pub fn leave_conversation(&self, user_id: UserId, conversation_id: ConversationId) {
        if let Some(mut members) = self.conversations.get_mut(&conversation_id) {
            members.remove(&user_id);
        }
        self.conversations
            .remove_if(&conversation_id, |_, members| members.is_empty());

        if let Some(mut joined) = self.user_conversations.get_mut(&user_id) {
            joined.remove(&conversation_id);
        }
        self.user_conversations
            .remove_if(&user_id, |_, joined| joined.is_empty());
    }

    /// Deliver to every client of every joined member.
    pub fn broadcast_to_conversation(&self, conversation_id: ConversationId, envelope: &Envelope) -> usize {
        let Some(frame) = envelope.to_frame() else {
            return 0;
        };
        self.active_users(conversation_id)
            .into_iter()
            .map(|user_id| self.hub.broadcast(user_id, &frame))
            .sum()
    }

    pub fn broadcast_to_all_users(&self, envelope: &Envelope) -> usize {
        envelope
            .to_frame()
            .map_or(0, |frame| self.hub.broadcast_all(&frame))
    }

    /// `user_status` to every chat client except the user's own.
    pub fn broadcast_global_status(&self, user_id: UserId, status: UserStatus) -> usize {
        let envelope = Envelope::new(
            EventKind::UserStatus,
            json!({ "status": status.as_str(), "user_id": user_id }),
        )
        .user(user_id);
        envelope
            .to_frame()
            .map_or(0, |frame| self.hub.broadcast_except(user_id, &frame))
    }

    /// Send a conversation presence snapshot to every chat client.
    pub fn chatroom_presence(
        &self,
        conversation: &Conversation,
        actor: UserId,
        username: &str,
        action: RoomPresenceAction,
    ) -> usize {
        let envelope = chatroom_presence_envelope(self, conversation, actor, username, action);
        self.broadcast_to_all_users(&envelope)
    }

    pub fn active_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.conversations
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_user_active(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        self.conversations
            .get(&conversation_id)
            .is_some_and(|members| members.contains(&user_id))
    }

    pub fn is_user_online(&self, user_id: UserId) -> bool {
        self.hub.is_online(user_id)
    }

    /// Route `chat:conv:*`, `typing:conv:*` and `presence:conv:*` into the
    /// joined members of each conversation.
    pub async fn start_wiring(
        self: &Arc<Self>,
        notifier: &Notifier,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let hub = Arc::downgrade(self);
        notifier
            .subscribe(&channels::CHAT_PATTERNS, cancel, move |msg| {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let Some((default_kind, conversation_id)) = route(&msg.channel) else {
                    tracing::warn!(channel = %msg.channel, "Unroutable chat channel");
                    return;
                };
                let mut envelope = match serde_json::from_str::<Envelope>(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(channel = %msg.channel, error = %e, "Malformed chat event");
                        return;
                    }
                };
                if envelope.kind == EventKind::Unknown {
                    envelope.kind = default_kind;
                }
                envelope.conversation_id = Some(conversation_id);
                hub.broadcast_to_conversation(conversation_id, &envelope);
            })
            .await?;
        tracing::info!("Chat hub wired to notifier");
        Ok(())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let parting = Envelope::new(
            EventKind::ServerShutdown,
            json!({ "message": "Server is shutting down" }),
        )
        .to_frame();
        let result =
            crate::ws::shutdown_clients("chat", self.hub.all_clients(), parting, timeout).await;
        self.conversations.clear();
        self.user_conversations.clear();
        result
    }

    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }
}

/// Event kind implied by a channel family, plus the conversation ID.
fn route(channel: &str) -> Option<(EventKind, ConversationId)> {
    [
        (channels::CHAT_PREFIX, EventKind::Message),
        (channels::TYPING_PREFIX, EventKind::Typing),
        (channels::PRESENCE_PREFIX, EventKind::Presence),
    ]
    .into_iter()
    .find_map(|(prefix, kind)| channels::parse_id(channel, prefix).map(|id| (kind, id)))
}

impl ClientRegistry for ChatHub {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn unregister_client(&self, client: &Arc<Client>) {
        self.remove(client);
    }
}
