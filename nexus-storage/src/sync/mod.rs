//! State synchronization service.
//!
//! [`StateSyncService`] is the only API feature code uses for shared state.
//! Reads go local view -> shared cache -> store and populate the layers they
//! missed. The local view only answers reads while an invalidation listener
//! is subscribed and the cache is reachable; otherwise nothing would tell this
//! node that its copy went stale. Writes go store -> local view -> shared cache -> broadcast, in
//! that order; a call returns success only after the store committed.
//!
//! The shared cache is optional at runtime. When it is unreachable the
//! service logs the transition once, serves everything from the store, and
//! queues the skipped broadcasts so other nodes hear about them when the cache
//! comes back.

use dashmap::DashMap;
use nexus_core::{
    CacheEntry, CacheError, InvalidationMessage, Revision, SharedCacheConfig, StateKey,
    StateRecord, StorageResult, SyncConfig, Timestamp, WriteOutcome,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::SharedCache;
use crate::store::StateStore;

mod local;
mod stats;

pub use local::{FenceUpdate, LocalView};
pub use stats::{SyncMetrics, SyncStats};

/// Composes a [`StateStore`] and an optional [`SharedCache`].
pub struct StateSyncService<S, C>
where
    S: StateStore,
    C: SharedCache,
{
    store: Arc<S>,
    cache: Option<Arc<C>>,
    config: SyncConfig,
    cache_ttl: Duration,
    retry_interval: Duration,
    local: LocalView,
    /// Broadcasts skipped while degraded, newest per key.
    pending: DashMap<StateKey, InvalidationMessage>,
    degraded: AtomicBool,
    /// Set while an invalidation listener holds a live subscription.
    listening: AtomicBool,
    /// Milliseconds since `epoch` before which the cache is not retried.
    retry_after_ms: AtomicU64,
    epoch: Instant,
    metrics: SyncMetrics,
}

impl<S, C> StateSyncService<S, C>
where
    S: StateStore,
    C: SharedCache,
{
    /// Create the service. `cache` is ignored when `cache_config.enabled` is
    /// false.
    pub fn new(
        store: Arc<S>,
        cache: Option<Arc<C>>,
        config: SyncConfig,
        cache_config: &SharedCacheConfig,
    ) -> Self {
        let cache = cache.filter(|_| cache_config.enabled);
        let cache_ttl = cache_config.ttl();
        let fence_ttl = cache_ttl.max(config.local_ttl());

        tracing::info!(
            node_id = %config.node_id,
            shared_cache = cache.is_some(),
            cache_ttl_secs = cache_ttl.as_secs(),
            "state sync service created"
        );

        Self {
            local: LocalView::new(config.local_ttl(), fence_ttl, config.local_capacity),
            store,
            cache,
            cache_ttl,
            retry_interval: cache_config.reconnect_backoff(),
            config,
            pending: DashMap::new(),
            degraded: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            retry_after_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            metrics: SyncMetrics::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<C>> {
        self.cache.as_ref()
    }

    /// Whether the last cache interaction failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SyncStats {
        self.metrics.snapshot()
    }

    /// Whether an invalidation listener is currently subscribed.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Broadcasts waiting for the cache to come back.
    pub fn pending_broadcasts(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // READ
    // ========================================================================

    /// Current record for `key`, or `None` if it does not exist.
    pub async fn read(&self, key: &StateKey) -> StorageResult<Option<StateRecord>> {
        if self.local_view_trusted() {
            if let Some(record) = self.local.get(key) {
                SyncMetrics::bump(&self.metrics.local_hits);
                return Ok(Some(record));
            }
        }

        if let Some(cache) = self.usable_cache() {
            match cache.get(key).await {
                Ok(Some(entry)) => {
                    self.cache_recovered().await;
                    if entry.is_tombstone() {
                        if self.local.tombstone_current(key, entry.revision) {
                            self.local.fence_with(key, entry.revision, true);
                            SyncMetrics::bump(&self.metrics.shared_hits);
                            return Ok(None);
                        }
                    } else if self.local.admits(key, entry.revision) {
                        if let Some(record) = entry.into_record() {
                            self.local.remember(&record);
                            SyncMetrics::bump(&self.metrics.shared_hits);
                            return Ok(Some(record));
                        }
                    }
                    tracing::trace!(key = %key, "cached entry older than known revision");
                }
                Ok(None) => self.cache_recovered().await,
                Err(e) => self.cache_failed("read", &e),
            }
        }

        SyncMetrics::bump(&self.metrics.store_reads);
        let record = self.store.fetch(key).await?;
        if let Some(record) = &record {
            self.local.remember(record);
            if let Some(cache) = self.usable_cache() {
                match cache.set(&CacheEntry::from_record(record), self.cache_ttl).await {
                    Ok(_) => self.cache_recovered().await,
                    Err(e) => self.cache_failed("populate", &e),
                }
            }
        }
        Ok(record)
    }

    // ========================================================================
    // WRITE
    // ========================================================================

    /// Unconditional write. Returns the committed record; its revision is
    /// higher than any revision the key had before the call.
    ///
    /// A concurrent writer may commit right after this one. The returned
    /// record is what this call wrote, not necessarily the latest state.
    pub async fn write(&self, key: &StateKey, payload: Value) -> StorageResult<StateRecord> {
        let record = self.store.write(key, &payload).await?;
        tracing::debug!(key = %key, revision = %record.revision, "state written");
        self.after_commit(&record).await;
        Ok(record)
    }

    /// Compare-and-increment write. On conflict nothing is written anywhere
    /// and this node's copy of the key is dropped.
    pub async fn write_if_revision(
        &self,
        key: &StateKey,
        expected: Revision,
        payload: Value,
    ) -> StorageResult<WriteOutcome> {
        let outcome = self.store.write_if_revision(key, expected, &payload).await?;
        match &outcome {
            WriteOutcome::Applied(record) => {
                tracing::debug!(key = %key, revision = %record.revision, "conditional write applied");
                self.after_commit(record).await;
            }
            WriteOutcome::RevisionConflict { .. } => {
                SyncMetrics::bump(&self.metrics.conflicts);
                tracing::debug!(key = %key, expected = %expected, "conditional write conflict");
                self.local.forget(key);
            }
        }
        Ok(outcome)
    }

    /// Delete `key` everywhere. Returns the tombstone revision, or `None` if
    /// the key had no live record.
    pub async fn delete(&self, key: &StateKey) -> StorageResult<Option<Revision>> {
        let tombstone = self.store.delete(key).await?;
        self.local.forget(key);

        match tombstone {
            Some(revision) => {
                SyncMetrics::bump(&self.metrics.writes);
                tracing::debug!(key = %key, revision = %revision, "state deleted");
                self.local.fence_with(key, revision, true);
                let message =
                    InvalidationMessage::deleted(key.clone(), revision, self.config.node_id.clone());
                self.propagate(CacheEntry::tombstone(key.clone(), revision), message)
                    .await;
            }
            None => {
                if let Some(cache) = self.usable_cache() {
                    if let Err(e) = cache.remove(key).await {
                        self.cache_failed("remove", &e);
                    }
                }
            }
        }
        Ok(tombstone)
    }

    /// Local copies are only as fresh as the invalidations that reach them.
    fn local_view_trusted(&self) -> bool {
        self.cache.is_some()
            && self.listening.load(Ordering::SeqCst)
            && !self.degraded.load(Ordering::SeqCst)
    }

    async fn after_commit(&self, record: &StateRecord) {
        SyncMetrics::bump(&self.metrics.writes);
        self.local.fence_with(&record.key, record.revision, false);
        self.local.remember(record);
        let message = InvalidationMessage::updated(
            record.key.clone(),
            record.revision,
            self.config.node_id.clone(),
        );
        self.propagate(CacheEntry::from_record(record), message).await;
    }

    /// Cache update then broadcast. Failures never reach the caller.
    async fn propagate(&self, entry: CacheEntry, message: InvalidationMessage) {
        if self.cache.is_none() {
            return;
        }
        let Some(cache) = self.usable_cache() else {
            self.defer(message);
            return;
        };
        if let Err(e) = cache.set(&entry, self.cache_ttl).await {
            self.cache_failed("update", &e);
            self.defer(message);
            return;
        }
        if let Err(e) = cache.publish(&message).await {
            self.cache_failed("publish", &e);
            self.defer(message);
            return;
        }
        self.cache_recovered().await;
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Drop this node's copy of `key`. Returns whether one was held.
    pub fn invalidate(&self, key: &StateKey) -> bool {
        self.local.forget(key)
    }

    /// Drop every locally held record.
    pub fn invalidate_all(&self) {
        self.local.clear();
    }

    /// Handle a broadcast from another node.
    ///
    /// Messages from this node and messages not newer than what this node
    /// already knows are ignored. A message only ever removes data.
    pub fn apply_invalidation(&self, message: &InvalidationMessage) -> bool {
        if message.origin == self.config.node_id {
            return false;
        }
        let update = self
            .local
            .fence_with(&message.key, message.revision, message.is_tombstone());
        if update == FenceUpdate::Stale {
            SyncMetrics::bump(&self.metrics.stale_invalidations);
            tracing::trace!(
                key = %message.key,
                revision = %message.revision,
                origin = %message.origin,
                "ignored stale invalidation"
            );
            return false;
        }
        self.local.forget_below(&message.key, message.revision);
        SyncMetrics::bump(&self.metrics.invalidations_applied);
        true
    }

    /// Listen on the invalidation channel until `shutdown` flips to `true`.
    ///
    /// Reconnects after `reconnect_backoff` whenever the subscription is lost.
    /// Every subscription starts from an empty local view, since messages
    /// sent before it were missed. Returns `None` when no cache is configured.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>>
    where
        S: 'static,
        C: 'static,
    {
        let cache = self.cache.clone()?;
        let service = Arc::clone(self);

        Some(tokio::spawn(async move {
            tracing::info!(node_id = %service.config.node_id, "invalidation listener started");
            let mut subscribed_before = false;

            'outer: loop {
                if *shutdown.borrow() {
                    break;
                }
                match cache.subscribe().await {
                    Ok(mut subscription) => {
                        service.invalidate_all();
                        service.cache_recovered().await;
                        service.listening.store(true, Ordering::SeqCst);
                        if subscribed_before {
                            tracing::info!("invalidation listener resubscribed, local view cleared");
                        }
                        subscribed_before = true;

                        loop {
                            tokio::select! {
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break 'outer;
                                    }
                                }
                                message = subscription.recv() => {
                                    match message {
                                        Some(message) => {
                                            service.apply_invalidation(&message);
                                        }
                                        None => {
                                            service.listening.store(false, Ordering::SeqCst);
                                            tracing::warn!("invalidation subscription lost");
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => service.cache_failed("subscribe", &e),
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(service.retry_interval) => {}
                }
            }

            service.listening.store(false, Ordering::SeqCst);
            tracing::info!("invalidation listener stopped");
        }))
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Purge store tombstones older than `older_than`, clamped so nothing
    /// younger than the cache TTL is removed.
    pub async fn purge_tombstones(&self, older_than: Timestamp) -> StorageResult<u64> {
        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or(chrono::Duration::zero());
        let horizon = older_than.min(chrono::Utc::now() - ttl);
        self.store.purge_tombstones(horizon).await
    }

    /// Probe the cache, updating degraded state. Returns the round trip.
    pub async fn check_cache(&self) -> Option<Duration> {
        let cache = self.cache.as_ref()?;
        match cache.ping().await {
            Ok(latency) => {
                self.cache_recovered().await;
                Some(latency)
            }
            Err(e) => {
                self.cache_failed("ping", &e);
                None
            }
        }
    }

    // ========================================================================
    // DEGRADED MODE
    // ========================================================================

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The cache, unless it is disabled or failed within the retry interval.
    fn usable_cache(&self) -> Option<&Arc<C>> {
        let cache = self.cache.as_ref()?;
        if self.degraded.load(Ordering::SeqCst)
            && self.now_ms() < self.retry_after_ms.load(Ordering::SeqCst)
        {
            SyncMetrics::bump(&self.metrics.degraded_ops);
            return None;
        }
        Some(cache)
    }

    fn cache_failed(&self, operation: &str, error: &CacheError) {
        SyncMetrics::bump(&self.metrics.degraded_ops);
        self.retry_after_ms.store(
            self.now_ms() + self.retry_interval.as_millis() as u64,
            Ordering::SeqCst,
        );
        if !self.degraded.swap(true, Ordering::SeqCst) {
            // invalidations sent from now on may never arrive
            self.local.clear();
            tracing::warn!(
                operation,
                error = %error,
                "shared cache unreachable, serving from the durable store"
            );
        } else {
            tracing::debug!(operation, error = %error, "shared cache still unreachable");
        }
    }

    async fn cache_recovered(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            self.local.clear();
            tracing::info!(
                pending = self.pending.len(),
                "shared cache reachable again"
            );
            self.flush_pending().await;
        }
    }

    fn defer(&self, message: InvalidationMessage) {
        if self.pending.len() >= self.config.pending_capacity
            && !self.pending.contains_key(&message.key)
        {
            SyncMetrics::bump(&self.metrics.dropped_broadcasts);
            tracing::warn!(
                key = %message.key,
                capacity = self.config.pending_capacity,
                "pending broadcast queue full, dropping"
            );
            return;
        }
        let key = message.key.clone();
        self.pending
            .entry(key)
            .and_modify(|queued| {
                if queued.revision < message.revision {
                    *queued = message.clone();
                }
            })
            .or_insert(message);
    }

    /// Reset the cache entry and re-broadcast every key written while
    /// degraded. Deleted keys get their tombstone back so a late repopulate
    /// of the old value is rejected.
    async fn flush_pending(&self) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let keys: Vec<StateKey> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some((_, message)) = self.pending.remove(&key) else {
                continue;
            };
            let reset = if message.is_tombstone() {
                cache
                    .set(&CacheEntry::tombstone(key.clone(), message.revision), self.cache_ttl)
                    .await
                    .map(|_| ())
            } else {
                cache.remove(&key).await
            };
            let result = match reset {
                Ok(()) => cache.publish(&message).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.defer(message);
                self.cache_failed("flush", &e);
                return;
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySharedCache;
    use crate::store::InMemoryStateStore;
    use serde_json::json;
    use uuid::Uuid;

    type Service = StateSyncService<InMemoryStateStore, InMemorySharedCache>;

    fn cache_config() -> SharedCacheConfig {
        SharedCacheConfig {
            reconnect_backoff_ms: 0,
            ..SharedCacheConfig::default()
        }
    }

    fn node(
        name: &str,
        store: &Arc<InMemoryStateStore>,
        cache: &Arc<InMemorySharedCache>,
    ) -> Service {
        StateSyncService::new(
            store.clone(),
            Some(cache.clone()),
            SyncConfig::default().with_node_id(name),
            &cache_config(),
        )
    }

    fn fixtures() -> (Arc<InMemoryStateStore>, Arc<InMemorySharedCache>) {
        (
            Arc::new(InMemoryStateStore::new(4, Duration::from_millis(200)).unwrap()),
            Arc::new(InMemorySharedCache::new()),
        )
    }

    fn key() -> StateKey {
        StateKey::new(Uuid::new_v4(), "levels").unwrap()
    }

    #[tokio::test]
    async fn test_write_populates_cache_and_broadcasts() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let mut sub = cache.subscribe().await.unwrap();
        let k = key();

        let record = svc.write(&k, json!({"level": 7})).await.unwrap();
        assert_eq!(record.revision, Revision::new(1));

        let cached = cache.peek(&k).unwrap();
        assert_eq!(cached.revision, Revision::new(1));
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.key, k);
        assert_eq!(msg.origin, "a");
    }

    #[tokio::test]
    async fn test_read_falls_through_and_populates() {
        let (store, cache) = fixtures();
        let k = key();
        store.write(&k, &json!({"level": 2})).await.unwrap();

        let svc = node("a", &store, &cache);
        let record = svc.read(&k).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"level": 2}));
        assert!(cache.peek(&k).is_some());

        // Without a listener the local view is never trusted.
        svc.read(&k).await.unwrap();
        let stats = svc.stats();
        assert_eq!(stats.store_reads, 1);
        assert_eq!(stats.shared_hits, 1);
        assert_eq!(stats.local_hits, 0);
    }

    async fn listening(svc: &Arc<Service>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let handle = svc.spawn_invalidation_listener(rx).unwrap();
        for _ in 0..100 {
            if svc.is_listening() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(svc.is_listening());
        (tx, handle)
    }

    #[tokio::test]
    async fn test_local_view_serves_reads_while_listening() {
        let (store, cache) = fixtures();
        let svc = Arc::new(node("a", &store, &cache));
        let (tx, handle) = listening(&svc).await;
        let k = key();
        svc.write(&k, json!({"level": 3})).await.unwrap();

        svc.read(&k).await.unwrap();
        assert_eq!(svc.stats().local_hits, 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!svc.is_listening());
        svc.read(&k).await.unwrap();
        assert_eq!(svc.stats().local_hits, 1);
        assert_eq!(svc.stats().shared_hits, 1);
    }

    #[tokio::test]
    async fn test_entering_degraded_clears_local_view() {
        let (store, cache) = fixtures();
        let svc = Arc::new(node("a", &store, &cache));
        let (tx, handle) = listening(&svc).await;
        let k = key();
        svc.write(&k, json!("v1")).await.unwrap();
        assert!(svc.local.get(&k).is_some());

        cache.set_reachable(false);
        svc.read(&key()).await.unwrap();
        assert!(svc.is_degraded());
        assert!(svc.local.is_empty());

        // A degraded read goes to the store even with a listener attached.
        store.write(&k, &json!("v2")).await.unwrap();
        let record = svc.read(&k).await.unwrap().unwrap();
        assert_eq!(record.payload, json!("v2"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_prefers_shared_cache_over_store() {
        let (store, cache) = fixtures();
        let writer = node("a", &store, &cache);
        let reader = node("b", &store, &cache);
        let k = key();
        writer.write(&k, json!("v1")).await.unwrap();

        assert_eq!(reader.read(&k).await.unwrap().unwrap().payload, json!("v1"));
        assert_eq!(reader.stats().shared_hits, 1);
        assert_eq!(reader.stats().store_reads, 0);
    }

    #[tokio::test]
    async fn test_own_invalidations_are_ignored() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();
        svc.write(&k, json!(1)).await.unwrap();

        let own = InvalidationMessage::updated(k.clone(), Revision::new(9), "a");
        assert!(!svc.apply_invalidation(&own));
        assert!(svc.local.get(&k).is_some());
    }

    #[tokio::test]
    async fn test_remote_invalidation_drops_older_copy() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();
        svc.write(&k, json!(1)).await.unwrap();

        let remote = InvalidationMessage::updated(k.clone(), Revision::new(2), "b");
        assert!(svc.apply_invalidation(&remote));
        assert!(svc.local.get(&k).is_none());

        // Duplicate delivery is stale.
        assert!(!svc.apply_invalidation(&remote));
        assert_eq!(svc.stats().stale_invalidations, 1);
    }

    #[tokio::test]
    async fn test_conflict_drops_local_copy() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();
        svc.write(&k, json!(1)).await.unwrap();

        let outcome = svc
            .write_if_revision(&k, Revision::new(7), json!(2))
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        assert!(svc.local.get(&k).is_none());
        assert_eq!(svc.stats().conflicts, 1);
    }

    #[tokio::test]
    async fn test_degraded_transition_and_recovery_flushes_pending() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();

        cache.set_reachable(false);
        svc.write(&k, json!("offline")).await.unwrap();
        assert!(svc.is_degraded());
        assert_eq!(svc.pending_broadcasts(), 1);
        assert_eq!(cache.published_count(), 0);

        cache.set_reachable(true);
        assert!(svc.check_cache().await.is_some());
        assert!(!svc.is_degraded());
        assert_eq!(svc.pending_broadcasts(), 0);
        assert_eq!(cache.published_count(), 1);
    }

    #[tokio::test]
    async fn test_full_pending_queue_drops_new_keys_only() {
        let (store, cache) = fixtures();
        let svc: Service = StateSyncService::new(
            store.clone(),
            Some(cache.clone()),
            SyncConfig {
                pending_capacity: 2,
                ..SyncConfig::default().with_node_id("a")
            },
            &cache_config(),
        );
        let (first, second, third) = (key(), key(), key());

        cache.set_reachable(false);
        svc.write(&first, json!(1)).await.unwrap();
        svc.write(&second, json!(1)).await.unwrap();
        svc.write(&third, json!(1)).await.unwrap();
        assert_eq!(svc.pending_broadcasts(), 2);
        assert_eq!(svc.stats().dropped_broadcasts, 1);

        // A queued key still takes its newer revision.
        svc.write(&first, json!(2)).await.unwrap();
        assert_eq!(svc.pending_broadcasts(), 2);
        assert_eq!(svc.stats().dropped_broadcasts, 1);

        cache.set_reachable(true);
        let mut sub = cache.subscribe().await.unwrap();
        assert!(svc.check_cache().await.is_some());
        let mut flushed = vec![sub.recv().await.unwrap(), sub.recv().await.unwrap()];
        flushed.sort_by_key(|m| m.revision);
        assert_eq!(flushed[0].key, second);
        assert_eq!(flushed[1].key, first);
        assert_eq!(flushed[1].revision, Revision::new(2));
    }

    #[tokio::test]
    async fn test_flush_restores_tombstone_for_deleted_keys() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();
        svc.write(&k, json!("v1")).await.unwrap();

        cache.set_reachable(false);
        svc.delete(&k).await.unwrap();
        assert_eq!(svc.pending_broadcasts(), 1);

        cache.set_reachable(true);
        assert!(svc.check_cache().await.is_some());
        let entry = cache.peek(&k).unwrap();
        assert!(entry.is_tombstone());
        assert_eq!(entry.revision, Revision::new(2));

        // A repopulate carrying the old value loses against the tombstone.
        let stale = StateRecord {
            key: k.clone(),
            payload: json!("v1"),
            revision: Revision::new(1),
            updated_at: chrono::Utc::now(),
        };
        let written = cache
            .set(&CacheEntry::from_record(&stale), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!written);
        assert!(cache.peek(&k).unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_never_touched() {
        let (store, cache) = fixtures();
        let config = SharedCacheConfig {
            enabled: false,
            ..cache_config()
        };
        let svc: Service = StateSyncService::new(
            store.clone(),
            Some(cache.clone()),
            SyncConfig::default(),
            &config,
        );
        let k = key();
        svc.write(&k, json!(1)).await.unwrap();
        assert!(svc.cache().is_none());
        assert!(cache.is_empty());
        assert!(!svc.is_degraded());
        assert_eq!(svc.pending_broadcasts(), 0);
    }

    #[tokio::test]
    async fn test_purge_respects_cache_ttl() {
        let (store, cache) = fixtures();
        let svc = node("a", &store, &cache);
        let k = key();
        svc.write(&k, json!(1)).await.unwrap();
        svc.delete(&k).await.unwrap();

        // Tombstone is younger than the cache TTL, so it survives.
        let purged = svc.purge_tombstones(chrono::Utc::now()).await.unwrap();
        assert_eq!(purged, 0);
        assert_eq!(store.stored_revision(&k), Some(Revision::new(2)));
    }
}
