//! Publish/subscribe bridge between hubs and processes.
//!
//! Every hub publishes through the [`Notifier`] and wires itself to it, so an
//! event published on any process reaches the local hubs of every process,
//! the origin included. When the remote backend fails, delivery degrades to
//! the in-process bus of this node. A subscription whose remote stream ends
//! is retried with backoff; until it is back, every publish is mirrored onto
//! the in-process bus so local sockets keep receiving.

pub mod channels;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::repo::{ConversationId, RoomId, UserId};
use crate::store::{MemoryStore, PubSub, PubSubMessage, StoreError};
use crate::ws::protocol::{Envelope, EventKind};

/// Typing indicators expire on the client after this long.
pub const TYPING_EXPIRES_MS: u64 = 5000;

const RESUBSCRIBE_MIN_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct Notifier {
    remote: Option<Arc<dyn PubSub>>,
    /// Publishes the remote backend refused.
    local: MemoryStore,
    /// Copies of remote publishes, consumed only by subscriptions whose
    /// remote stream is down.
    mirror: MemoryStore,
    /// Subscriptions currently without a remote stream.
    degraded: Arc<AtomicUsize>,
}

impl Notifier {
    /// Single-process notifier backed only by the in-process bus.
    pub fn local_only() -> Self {
        Self {
            remote: None,
            local: MemoryStore::new(),
            mirror: MemoryStore::new(),
            degraded: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_backend(remote: Arc<dyn PubSub>) -> Self {
        Self {
            remote: Some(remote),
            ..Self::local_only()
        }
    }

    /// True while at least one subscription has lost its remote stream.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst) > 0
    }

    pub async fn publish(&self, channel: &str, payload: &str) {
        if let Some(remote) = &self.remote {
            match remote.publish(channel, payload).await {
                Ok(()) => {
                    if self.is_degraded() {
                        let _ = self.mirror.publish(channel, payload).await;
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(channel, error = %e, "Pub/sub publish failed, delivering in-process only");
                }
            }
        }
        // The in-process bus cannot fail.
        let _ = self.local.publish(channel, payload).await;
    }

    pub async fn publish_envelope(&self, channel: &str, envelope: &Envelope) {
        if let Some(json) = envelope.to_json() {
            self.publish(channel, &json).await;
        }
    }

    pub async fn publish_user(&self, user_id: UserId, envelope: &Envelope) {
        self.publish_envelope(&channels::user(user_id), envelope).await;
    }

    pub async fn publish_broadcast(&self, envelope: &Envelope) {
        self.publish_envelope(channels::BROADCAST, envelope).await;
    }

    pub async fn publish_chat_message(&self, conversation_id: ConversationId, envelope: &Envelope) {
        self.publish_envelope(&channels::conversation(conversation_id), envelope)
            .await;
    }

    pub async fn publish_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        username: &str,
        is_typing: bool,
    ) {
        let envelope = Envelope::new(
            EventKind::Typing,
            json!({
                "user_id": user_id,
                "username": username,
                "is_typing": is_typing,
                "expires_in_ms": TYPING_EXPIRES_MS,
            }),
        )
        .conversation(conversation_id)
        .user(user_id)
        .username(username);
        self.publish_envelope(&channels::typing(conversation_id), &envelope)
            .await;
    }

    pub async fn publish_presence(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        username: &str,
        status: &str,
    ) {
        let envelope = Envelope::new(
            EventKind::Presence,
            json!({ "user_id": user_id, "username": username, "status": status }),
        )
        .conversation(conversation_id)
        .user(user_id)
        .username(username);
        self.publish_envelope(&channels::presence(conversation_id), &envelope)
            .await;
    }

    pub async fn publish_game_action(&self, room_id: RoomId, envelope: &Envelope) {
        self.publish_envelope(&channels::game_room(room_id), envelope).await;
    }

    pub async fn publish_video_signal(&self, room: &str, payload: &str) {
        self.publish(&channels::videochat_room(room), payload).await;
    }

    /// Invoke `on_message` for every message on `patterns` until `cancel`
    /// fires. Subscribes to both the remote backend and the in-process bus
    /// so degraded publishes still arrive. A lost remote stream is
    /// re-established with exponential backoff.
    pub async fn subscribe<F>(
        &self,
        patterns: &[&str],
        cancel: CancellationToken,
        on_message: F,
    ) -> Result<(), StoreError>
    where
        F: Fn(PubSubMessage) + Send + Sync + 'static,
    {
        let mut local = self.local.psubscribe(patterns).await?;
        let mut mirror = self.mirror.psubscribe(patterns).await?;
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();

        let mut link = RemoteLink {
            backend: self.remote.clone(),
            stream: None,
            down: false,
            backoff: RESUBSCRIBE_MIN_BACKOFF,
            retry_at: tokio::time::Instant::now(),
            degraded: self.degraded.clone(),
        };
        if link.backend.is_some() {
            link.connect(&patterns).await;
        }

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(msg) = local.recv() => Inbound::Message(msg),
                    Some(msg) = mirror.recv() => Inbound::Mirrored(msg),
                    msg = recv_optional(&mut link.stream), if link.stream.is_some() => Inbound::Remote(msg),
                    _ = tokio::time::sleep_until(link.retry_at), if link.wants_retry() => Inbound::Retry,
                    else => break,
                };
                match event {
                    Inbound::Message(msg) | Inbound::Remote(Some(msg)) => on_message(msg),
                    Inbound::Mirrored(msg) => {
                        if link.down {
                            on_message(msg);
                        }
                    }
                    Inbound::Remote(None) => {
                        tracing::warn!(?patterns, "Remote subscription ended, resubscribing");
                        link.stream = None;
                        link.mark_down();
                    }
                    Inbound::Retry => link.connect(&patterns).await,
                }
            }
            link.mark_up();
            tracing::debug!(?patterns, "Subscription stopped");
        });

        Ok(())
    }
}

enum Inbound {
    Message(PubSubMessage),
    Mirrored(PubSubMessage),
    Remote(Option<PubSubMessage>),
    Retry,
}

/// One subscription's view of the remote backend.
struct RemoteLink {
    backend: Option<Arc<dyn PubSub>>,
    stream: Option<mpsc::Receiver<PubSubMessage>>,
    down: bool,
    backoff: Duration,
    retry_at: tokio::time::Instant,
    degraded: Arc<AtomicUsize>,
}

impl RemoteLink {
    fn wants_retry(&self) -> bool {
        self.backend.is_some() && self.stream.is_none()
    }

    async fn connect(&mut self, patterns: &[String]) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        match backend.psubscribe(&patterns).await {
            Ok(stream) => {
                if self.down {
                    tracing::info!(?patterns, "Remote subscription restored");
                }
                self.stream = Some(stream);
                self.backoff = RESUBSCRIBE_MIN_BACKOFF;
                self.mark_up();
            }
            Err(e) => {
                tracing::warn!(?patterns, error = %e, retry_in = ?self.backoff, "Remote subscribe failed, using in-process delivery");
                self.mark_down();
                self.retry_at = tokio::time::Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
            }
        }
    }

    fn mark_down(&mut self) {
        if !self.down {
            self.down = true;
            self.degraded.fetch_add(1, Ordering::SeqCst);
        }
        if self.stream.is_none() {
            self.retry_at = tokio::time::Instant::now() + self.backoff;
        }
    }

    fn mark_up(&mut self) {
        if self.down {
            self.down = false;
            self.degraded.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

async fn recv_optional(rx: &mut Option<mpsc::Receiver<PubSubMessage>>) -> Option<PubSubMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
