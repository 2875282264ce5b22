//! Shared store: key/value operations with TTLs plus pattern pub/sub.
//!
//! Two backends implement both traits: [`RedisStore`] for multi-process
//! deployments and [`MemoryStore`], the in-process fallback used when no
//! Redis URL is configured (and by the test suite).

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Buffer size of the channel handed out by [`PubSub::psubscribe`].
pub const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A message delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically read and delete `key`.
    async fn get_del(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment a fixed-window counter. The window starts on the first hit.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to channel patterns (`*` matches any suffix).
    ///
    /// Messages published after this returns are delivered in publish order
    /// until the receiver is dropped.
    async fn psubscribe(
        &self,
        patterns: &[&str],
    ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError>;
}

/// Glob match used by the in-process bus. Only a trailing `*` is special.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
