//! In-process shared cache.
//!
//! One instance stands in for the networked cache of a whole fleet: hand the
//! same `Arc<InMemorySharedCache>` to several sync services and they behave
//! like separate processes talking to one Redis. Reachability can be toggled
//! to exercise degraded mode.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nexus_core::{CacheEntry, CacheError, CacheResult, InvalidationMessage, StateKey};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

use super::{InvalidationSubscription, SharedCache, SUBSCRIPTION_BUFFER};

struct StoredEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Shared cache living in process memory.
pub struct InMemorySharedCache {
    entries: DashMap<StateKey, StoredEntry>,
    bus: broadcast::Sender<InvalidationMessage>,
    reachable: AtomicBool,
    published: AtomicU64,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        Self {
            entries: DashMap::new(),
            bus,
            reachable: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// While unreachable every call fails with `CacheError::Unreachable` and
    /// open subscriptions receive nothing.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Cached entry for `key`, bypassing reachability. Expired entries are
    /// reported as absent.
    pub fn peek(&self, key: &StateKey) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|stored| !stored.is_expired())
            .map(|stored| stored.entry.clone())
    }

    /// Plant an entry without the revision guard.
    pub fn insert_raw(&self, entry: CacheEntry, ttl: Duration) {
        self.entries.insert(
            entry.key.clone(),
            StoredEntry {
                entry,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Messages successfully published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_reachable(&self) -> CacheResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unreachable {
                reason: "in-memory cache marked unreachable".to_string(),
            })
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &StateKey) -> CacheResult<Option<CacheEntry>> {
        self.check_reachable()?;
        Ok(self.peek(key))
    }

    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> CacheResult<bool> {
        self.check_reachable()?;
        let stored = StoredEntry {
            entry: entry.clone(),
            expires_at: Instant::now() + ttl,
        };
        match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if !current.is_expired() && current.entry.revision >= entry.revision {
                    return Ok(false);
                }
                occupied.insert(stored);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
            }
        }
        Ok(true)
    }

    async fn remove(&self, key: &StateKey) -> CacheResult<()> {
        self.check_reachable()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        self.check_reachable()?;
        // No subscribers is not an error.
        let _ = self.bus.send(message.clone());
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> CacheResult<InvalidationSubscription> {
        self.check_reachable()?;
        let mut bus = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "invalidation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(InvalidationSubscription::new(rx, forwarder))
    }

    async fn ping(&self) -> CacheResult<Duration> {
        let started = Instant::now();
        self.check_reachable()?;
        Ok(started.elapsed())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nexus_core::{Revision, StateRecord};
    use serde_json::json;
    use uuid::Uuid;

    fn entry(key: &StateKey, revision: i64) -> CacheEntry {
        CacheEntry::from_record(&StateRecord {
            key: key.clone(),
            payload: json!({"rev": revision}),
            revision: Revision::new(revision),
            updated_at: Utc::now(),
        })
    }

    fn key() -> StateKey {
        StateKey::new(Uuid::new_v4(), "levels").unwrap()
    }

    #[tokio::test]
    async fn test_set_never_downgrades() {
        let cache = InMemorySharedCache::new();
        let k = key();
        let ttl = Duration::from_secs(60);

        assert!(cache.set(&entry(&k, 5), ttl).await.unwrap());
        assert!(!cache.set(&entry(&k, 4), ttl).await.unwrap());
        assert!(!cache.set(&entry(&k, 5), ttl).await.unwrap());
        assert_eq!(cache.get(&k).await.unwrap().unwrap().revision, Revision::new(5));

        let tombstone = CacheEntry::tombstone(k.clone(), Revision::new(6));
        assert!(cache.set(&tombstone, ttl).await.unwrap());
        assert!(!cache.set(&entry(&k, 5), ttl).await.unwrap());
        assert!(cache.get(&k).await.unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_missing() {
        let cache = InMemorySharedCache::new();
        let k = key();
        cache.set(&entry(&k, 1), Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(cache.set(&entry(&k, 1), Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_call() {
        let cache = InMemorySharedCache::new();
        cache.set_reachable(false);
        let k = key();
        assert!(matches!(
            cache.get(&k).await,
            Err(CacheError::Unreachable { .. })
        ));
        assert!(cache.set(&entry(&k, 1), Duration::from_secs(1)).await.is_err());
        assert!(cache.ping().await.is_err());
        assert!(cache.subscribe().await.is_err());
        assert!(cache.peek(&k).is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let cache = InMemorySharedCache::new();
        let mut a = cache.subscribe().await.unwrap();
        let mut b = cache.subscribe().await.unwrap();

        let msg = InvalidationMessage::updated(key(), Revision::new(2), "lobby-1");
        cache.publish(&msg).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), msg);
        assert_eq!(b.recv().await.unwrap(), msg);
        assert_eq!(cache.published_count(), 1);
    }
}
