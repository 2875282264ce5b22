use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::{KeyValueStore, PubSub, PubSubMessage, StoreError, SUBSCRIPTION_BUFFER};

/// Redis-backed store. Commands share one multiplexed connection manager;
/// each pattern subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("Connected to Redis");
        Ok(Self { client, conn })
    }
}

fn whole_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, whole_seconds(ttl)).await?;
        Ok(())
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX EX opens the window with its expiry; INCR keeps the TTL.
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("EX")
            .arg(whole_seconds(window))
            .arg("NX")
            .ignore()
            .incr(key, 1u64)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn psubscribe(
        &self,
        patterns: &[&str],
    ) -> Result<mpsc::Receiver<PubSubMessage>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(channel = msg.get_channel_name(), error = %e, "Dropping non-UTF-8 pub/sub payload");
                        continue;
                    }
                };
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::warn!(?patterns, "Redis subscription ended");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs only when `REALTIME_TEST_REDIS_URL` points at a disposable Redis.
    async fn store() -> Option<RedisStore> {
        let url = std::env::var("REALTIME_TEST_REDIS_URL").ok()?;
        Some(RedisStore::connect(&url).await.unwrap())
    }

    #[tokio::test]
    async fn concurrent_window_hits_count_once_each_and_keep_the_expiry() {
        let Some(store) = store().await else {
            return;
        };
        let key = format!("rl:test:{}", uuid::Uuid::new_v4());

        let hits: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                let key = key.clone();
                tokio::spawn(async move { store.incr_window(&key, Duration::from_secs(30)).await.unwrap() })
            })
            .collect();
        let mut counts = Vec::new();
        for hit in hits {
            counts.push(hit.await.unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=20).collect::<Vec<u64>>());

        let mut conn = store.conn.clone();
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!((1..=30).contains(&ttl), "ttl {ttl}");
        let _: () = conn.del(&key).await.unwrap();
    }
}
