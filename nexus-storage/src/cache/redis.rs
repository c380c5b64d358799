//! Redis shared cache.
//!
//! Entries are JSON strings under `{key_prefix}{namespace}:{entity_id}` with a
//! millisecond TTL. Writes go through a Lua script that compares revisions
//! server-side, so the "never downgrade" rule holds across processes.
//! Invalidations travel on one pub/sub channel.
//!
//! Every command is bounded by the configured operation timeout. A dropped or
//! timed-out connection is discarded and reopened on the next call.

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError, RedisResult, Script};
use async_trait::async_trait;
use futures_util::StreamExt;
use nexus_core::{
    CacheEntry, CacheError, CacheResult, InvalidationMessage, SharedCacheConfig, StateKey,
};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use super::{InvalidationSubscription, SharedCache, SUBSCRIPTION_BUFFER};

/// KEYS[1] = cache key, ARGV[1] = encoded entry, ARGV[2] = revision,
/// ARGV[3] = ttl in milliseconds. Returns 1 if stored, 0 if a revision at
/// least as high is already present.
const GUARDED_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if ok and decoded['revision'] and tonumber(decoded['revision']) >= tonumber(ARGV[2]) then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
return 1
"#;

/// [`SharedCache`] backed by Redis.
pub struct RedisSharedCache {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    guarded_set: Script,
    config: SharedCacheConfig,
}

impl RedisSharedCache {
    /// Parse the URL. No connection is opened until the first call.
    pub fn new(config: SharedCacheConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| CacheError::Unreachable {
            reason: format!("invalid cache url: {}", e),
        })?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            guarded_set: Script::new(GUARDED_SET),
            config,
        })
    }

    pub fn config(&self) -> &SharedCacheConfig {
        &self.config
    }

    fn cache_key(&self, key: &StateKey) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .bounded("connect", self.client.get_multiplexed_async_connection())
            .await?;
        tracing::debug!(url = %self.config.url, "shared cache connection opened");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn discard_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Apply the operation timeout and map failures. Does not touch the
    /// cached connection.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let after = self.config.op_timeout();
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(e)),
            Err(_) => Err(CacheError::Timeout {
                operation: operation.to_string(),
                after,
            }),
        }
    }

    /// Like [`Self::bounded`], discarding the connection if it looks broken.
    async fn run<T, F>(&self, operation: &str, fut: F) -> CacheResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        let result = self.bounded(operation, fut).await;
        if matches!(
            result,
            Err(CacheError::Unreachable { .. }) | Err(CacheError::Timeout { .. })
        ) {
            self.discard_connection().await;
        }
        result
    }
}

fn map_redis_error(e: RedisError) -> CacheError {
    CacheError::Unreachable {
        reason: e.to_string(),
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &StateKey) -> CacheResult<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self
            .run(
                "get",
                ::redis::cmd("GET")
                    .arg(self.cache_key(key))
                    .query_async(&mut conn),
            )
            .await?;
        match raw {
            Some(raw) => CacheEntry::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> CacheResult<bool> {
        let encoded = entry.encode()?;
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let mut conn = self.connection().await?;

        let mut invocation = self.guarded_set.key(self.cache_key(&entry.key));
        invocation
            .arg(encoded)
            .arg(entry.revision.get())
            .arg(ttl_ms);
        let stored: i64 = self.run("set", invocation.invoke_async(&mut conn)).await?;
        Ok(stored == 1)
    }

    async fn remove(&self, key: &StateKey) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _removed: i64 = self
            .run(
                "remove",
                ::redis::cmd("DEL")
                    .arg(self.cache_key(key))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let wire = message.to_wire()?;
        let mut conn = self.connection().await?;
        let _receivers: i64 = self
            .run(
                "publish",
                ::redis::cmd("PUBLISH")
                    .arg(&self.config.channel)
                    .arg(wire)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> CacheResult<InvalidationSubscription> {
        let mut pubsub = self
            .bounded("subscribe", self.client.get_async_pubsub())
            .await?;
        self.bounded("subscribe", pubsub.subscribe(&self.config.channel))
            .await?;
        tracing::info!(channel = %self.config.channel, "subscribed to invalidation channel");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = self.config.channel.clone();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let raw: String = match msg.get_payload() {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(error = %e, "unreadable invalidation payload");
                        continue;
                    }
                };
                match InvalidationMessage::from_wire(&raw) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed invalidation message"),
                }
            }
            tracing::warn!(channel = %channel, "invalidation subscription closed");
        });
        Ok(InvalidationSubscription::new(rx, forwarder))
    }

    async fn ping(&self) -> CacheResult<Duration> {
        let started = Instant::now();
        let mut conn = self.connection().await?;
        let _pong: String = self
            .run("ping", ::redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(started.elapsed())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_rejects_malformed_url() {
        let config = SharedCacheConfig {
            url: "not a url".to_string(),
            ..SharedCacheConfig::default()
        };
        assert!(matches!(
            RedisSharedCache::new(config),
            Err(CacheError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_cache_key_uses_prefix() {
        let cache = RedisSharedCache::new(SharedCacheConfig {
            key_prefix: "survival:".to_string(),
            ..SharedCacheConfig::default()
        })
        .unwrap();
        let key = StateKey::new(Uuid::nil(), "levels").unwrap();
        assert_eq!(
            cache.cache_key(&key),
            "survival:levels:00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error_within_timeout() {
        let cache = RedisSharedCache::new(SharedCacheConfig {
            url: "redis://127.0.0.1:1/0".to_string(),
            op_timeout_ms: 200,
            ..SharedCacheConfig::default()
        })
        .unwrap();
        let started = Instant::now();
        let err = cache.ping().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Unreachable { .. } | CacheError::Timeout { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
