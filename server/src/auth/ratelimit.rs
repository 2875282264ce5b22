//! Fixed-window rate limiting over the shared store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{KeyValueStore, StoreError};

/// What to do when the counter store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    #[default]
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct Limit {
    pub resource: &'static str,
    pub max: u64,
    pub window: Duration,
}

pub const TYPING: Limit = Limit {
    resource: "ws_typing",
    max: 10,
    window: Duration::from_secs(10),
};

pub const SEND_CHAT: Limit = Limit {
    resource: "ws_send_chat",
    max: 15,
    window: Duration::from_secs(60),
};

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    policy: FailPolicy,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: FailPolicy, enabled: bool) -> Self {
        Self {
            store,
            policy,
            enabled,
        }
    }

    pub fn disabled(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, FailPolicy::Open, false)
    }

    /// Count one hit. Allowed while the window's count is within `limit`.
    pub async fn check(
        &self,
        resource: &str,
        identity: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool, StoreError> {
        let key = format!("rl:{resource}:{identity}");
        let count = self.store.incr_window(&key, window).await?;
        Ok(count <= limit)
    }

    /// [`check`](Self::check) with the fail policy applied.
    pub async fn allow(&self, limit: Limit, identity: &str) -> bool {
        if !self.enabled {
            return true;
        }
        match self.check(limit.resource, identity, limit.max, limit.window).await {
            Ok(allowed) => {
                if !allowed {
                    tracing::debug!(resource = limit.resource, identity, "Rate limit exceeded");
                }
                allowed
            }
            Err(e) => {
                tracing::warn!(resource = limit.resource, error = %e, policy = ?self.policy, "Rate limiter store failure");
                self.policy == FailPolicy::Open
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn get_del(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn incr_window(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    const TIGHT: Limit = Limit {
        resource: "test",
        max: 2,
        window: Duration::from_secs(60),
    };

    #[tokio::test]
    async fn allows_up_to_limit_per_identity() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), FailPolicy::Open, true);
        assert!(limiter.allow(TIGHT, "1").await);
        assert!(limiter.allow(TIGHT, "1").await);
        assert!(!limiter.allow(TIGHT, "1").await);
        assert!(limiter.allow(TIGHT, "2").await);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::disabled(Arc::new(MemoryStore::new()));
        for _ in 0..5 {
            assert!(limiter.allow(TIGHT, "1").await);
        }
    }

    #[tokio::test]
    async fn fail_policy_decides_on_store_failure() {
        let open = RateLimiter::new(Arc::new(DownStore), FailPolicy::Open, true);
        let closed = RateLimiter::new(Arc::new(DownStore), FailPolicy::Closed, true);
        assert!(open.allow(TIGHT, "1").await);
        assert!(!closed.allow(TIGHT, "1").await);
    }
}
