use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::auth::ratelimit::RateLimiter;
use crate::auth::ticket::TicketAuthority;
use crate::chat::ChatHub;
use crate::config::Config;
use crate::game::GameHub;
use crate::notify::Notifier;
use crate::repo::{
    ChatRepository, GameRepository, MemoryChatRepository, MemoryGameRepository, MemoryUserRepository,
    UserRepository,
};
use crate::store::{KeyValueStore, MemoryStore, PubSub, RedisStore, StoreError};
use crate::voice::VideoChatHub;
use crate::ws::hub::Hub;
use crate::ws::presence::ConnectionManager;
use crate::ws::ShutdownError;

const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Where keys live and how events cross process boundaries.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn KeyValueStore>,
    /// `None` keeps pub/sub inside this process.
    pub pubsub: Option<Arc<dyn PubSub>>,
    memory: Option<MemoryStore>,
}

impl Backend {
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            store: Arc::new(store.clone()),
            pubsub: None,
            memory: Some(store),
        }
    }

    /// Share one in-memory store and bus between several hubs in a process.
    pub fn shared_memory(store: MemoryStore) -> Self {
        Self {
            store: Arc::new(store.clone()),
            pubsub: Some(Arc::new(store.clone())),
            memory: Some(store),
        }
    }

    pub async fn redis(url: &str) -> Result<Self, StoreError> {
        let store = Arc::new(RedisStore::connect(url).await?);
        Ok(Self {
            store: store.clone(),
            pubsub: Some(store),
            memory: None,
        })
    }
}

/// Collaborators owned by the rest of the platform.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub games: Arc<dyn GameRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(MemoryUserRepository::new()),
            chats: Arc::new(MemoryChatRepository::new()),
            games: Arc::new(MemoryGameRepository::new()),
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared key/value store (tickets, revocations, rate-limit counters)
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: Arc<Notifier>,
    /// Online/offline tracking shared by the notification and chat hubs
    pub presence: Arc<ConnectionManager>,
    /// Notification sockets
    pub hub: Arc<Hub>,
    pub chat_hub: Arc<ChatHub>,
    pub game_hub: Arc<GameHub>,
    pub video_hub: Arc<VideoChatHub>,
    pub tickets: Arc<TicketAuthority>,
    pub rate_limiter: Arc<RateLimiter>,
    pub users: Arc<dyn UserRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub games: Arc<dyn GameRepository>,
    /// HS256 bearer token secret
    pub jwt_secret: Vec<u8>,
    memory: Option<MemoryStore>,
}

impl AppState {
    pub fn new(config: Config, backend: Backend, repos: Repositories) -> Self {
        let limits = config.limits.clone();
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let jwt_secret = match &config.jwt_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                tracing::warn!("No JWT secret configured, generating an ephemeral one");
                rand::rng().random::<[u8; 32]>().to_vec()
            }
        };

        let notifier = Arc::new(match &backend.pubsub {
            Some(remote) => Notifier::with_backend(remote.clone()),
            None => Notifier::local_only(),
        });
        let presence = Arc::new(
            ConnectionManager::new(node_id)
                .with_timing(limits.presence_ttl(), limits.presence_heartbeat()),
        );
        let hub = Arc::new(Hub::new("notifications", presence.clone(), limits.hub_limits()));
        let chat_hub = ChatHub::new(presence.clone(), limits.hub_limits());
        let game_hub = Arc::new(
            GameHub::new(repos.games.clone(), notifier.clone())
                .with_pending_max_idle(limits.pending_room_max_idle())
                .with_capacity(limits.hub_limits()),
        );
        let video_hub = Arc::new(
            VideoChatHub::new(notifier.clone()).with_queue_capacity(limits.client_queue_size),
        );
        let tickets = Arc::new(TicketAuthority::new(
            backend.store.clone(),
            limits.ticket_ttl(),
            limits.consumed_ticket_grace(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            backend.store.clone(),
            limits.rate_limit_fail_policy,
            config.rate_limiting_enabled(),
        ));

        Self {
            config: Arc::new(config),
            store: backend.store,
            notifier,
            presence,
            hub,
            chat_hub,
            game_hub,
            video_hub,
            tickets,
            rate_limiter,
            users: repos.users,
            chats: repos.chats,
            games: repos.games,
            jwt_secret,
            memory: backend.memory,
        }
    }

    /// Wire every hub to the notifier and start the periodic sweepers.
    pub async fn start_background(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        self.presence
            .start_wiring(self.notifier.clone(), cancel.clone())
            .await?;
        self.hub.start_wiring(&self.notifier, cancel.clone()).await?;
        self.chat_hub.start_wiring(&self.notifier, cancel.clone()).await?;
        self.game_hub.start_wiring(cancel.clone()).await?;
        self.video_hub.start_wiring(cancel.clone()).await?;
        self.tickets.spawn_sweeper(cancel.clone());

        if let Some(memory) = self.memory.clone() {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MEMORY_PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            memory.purge_expired();
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Close every socket on every hub, each bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<ShutdownError> {
        let (notifications, chat, game, video) = tokio::join!(
            self.hub.shutdown(timeout),
            self.chat_hub.shutdown(timeout),
            self.game_hub.shutdown(timeout),
            self.video_hub.shutdown(timeout),
        );
        [notifications, chat, game, video]
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}
