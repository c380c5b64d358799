//! Behavioural properties of the sync layer, run against the in-memory store
//! and cache. Several services sharing one store and one cache stand in for
//! separate server processes.

use nexus_core::{
    InvalidationMessage, Revision, SharedCacheConfig, StateKey, StorageError, SyncConfig,
};
use nexus_storage::{InMemorySharedCache, InMemoryStateStore, StateStore, StateSyncService};
use nexus_test_utils::{assertions, generators};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

type Node = StateSyncService<InMemoryStateStore, InMemorySharedCache>;

struct Fleet {
    store: Arc<InMemoryStateStore>,
    cache: Arc<InMemorySharedCache>,
}

impl Fleet {
    fn new(pool_size: usize, wait: Duration) -> Self {
        Self {
            store: Arc::new(InMemoryStateStore::new(pool_size, wait).unwrap()),
            cache: Arc::new(InMemorySharedCache::new()),
        }
    }

    fn node(&self, name: &str) -> Arc<Node> {
        let cache_config = SharedCacheConfig {
            reconnect_backoff_ms: 10,
            ..SharedCacheConfig::default()
        };
        Arc::new(StateSyncService::new(
            self.store.clone(),
            Some(self.cache.clone()),
            SyncConfig::default().with_node_id(name),
            &cache_config,
        ))
    }
}

fn key(ns: &str) -> StateKey {
    StateKey::new(Uuid::new_v4(), ns).unwrap()
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
// CONCURRENT WRITERS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_get_distinct_increasing_revisions() {
    let fleet = Fleet::new(8, Duration::from_secs(1));
    let a = fleet.node("survival-1");
    let b = fleet.node("survival-2");
    let k = key("economy");

    let before = a.write(&k, json!({"balance": 0})).await.unwrap().revision;

    let (ra, rb) = tokio::join!(
        {
            let (a, k) = (a.clone(), k.clone());
            tokio::spawn(async move { a.write(&k, json!({"balance": 10})).await })
        },
        {
            let (b, k) = (b.clone(), k.clone());
            tokio::spawn(async move { b.write(&k, json!({"balance": 20})).await })
        }
    );
    let ra = ra.unwrap().unwrap();
    let rb = rb.unwrap().unwrap();

    assert_ne!(ra.revision, rb.revision);
    assert!(ra.revision > before && rb.revision > before);

    let last = if ra.revision > rb.revision { &ra } else { &rb };
    let stored = fleet.store.fetch(&k).await.unwrap().unwrap();
    assert_eq!(stored.revision, last.revision);
    assert_eq!(stored.payload, last.payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_writers_never_share_a_revision() {
    let fleet = Fleet::new(4, Duration::from_secs(2));
    let k = key("levels");
    let mut handles = Vec::new();
    for i in 0..32 {
        let node = fleet.node(&format!("node-{}", i % 4));
        let k = k.clone();
        handles.push(tokio::spawn(async move {
            node.write(&k, json!({ "writer": i })).await.unwrap().revision
        }));
    }

    let mut revisions = Vec::new();
    for handle in handles {
        revisions.push(handle.await.unwrap());
    }
    revisions.sort();
    revisions.dedup();
    assert_eq!(revisions.len(), 32);
    assert_eq!(revisions.last().copied(), Some(Revision::new(32)));
}

// ============================================================================
// COMPARE AND INCREMENT
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// A conditional write applies exactly when the expected revision is the
    /// stored one, and a rejected write leaves the store as it was.
    #[test]
    fn prop_conditional_write_applies_iff_revision_matches(
        writes in 0i64..6,
        expected in 0i64..8,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let fleet = Fleet::new(2, Duration::from_millis(200));
            let node = fleet.node("lobby-1");
            let k = key("economy");
            for i in 0..writes {
                node.write(&k, json!(i)).await.unwrap();
            }
            let before = fleet.store.fetch(&k).await.unwrap();

            let outcome = node
                .write_if_revision(&k, Revision::new(expected), json!("cas"))
                .await
                .unwrap();

            if expected == writes {
                let record = assertions::assert_applied(&outcome);
                prop_assert_eq!(record.revision, Revision::new(writes + 1));
                prop_assert_eq!(node.read(&k).await.unwrap().unwrap().payload, json!("cas"));
            } else {
                assertions::assert_conflict(&outcome);
                prop_assert_eq!(fleet.store.fetch(&k).await.unwrap(), before);
            }
            Ok(())
        })?;
    }

    /// Whatever the payload, a peer reads back exactly what was committed, and
    /// a conditional write against any other revision changes nothing.
    #[test]
    fn prop_committed_payload_is_what_peers_read(
        payload in generators::arb_payload(),
        guess in generators::arb_revision(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let fleet = Fleet::new(2, Duration::from_millis(200));
            let (a, b) = (fleet.node("a"), fleet.node("b"));
            let k = key("economy");

            let written = a.write(&k, payload.clone()).await.unwrap();
            let seen = b.read(&k).await.unwrap().unwrap();
            prop_assert_eq!(&seen.payload, &payload);
            prop_assert_eq!(seen.revision, written.revision);

            let outcome = b
                .write_if_revision(&k, guess, json!("overwrite"))
                .await
                .unwrap();
            if guess == written.revision {
                assertions::assert_applied(&outcome);
            } else {
                assertions::assert_conflict(&outcome);
                prop_assert_eq!(a.read(&k).await.unwrap().unwrap().payload, payload);
            }
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_conditional_writes_have_one_winner() {
    let fleet = Fleet::new(8, Duration::from_secs(1));
    let k = key("economy");
    let seed = fleet.node("a").write(&k, json!(0)).await.unwrap().revision;

    let mut handles = Vec::new();
    for i in 0..8 {
        let node = fleet.node(&format!("n{}", i));
        let k = k.clone();
        handles.push(tokio::spawn(async move {
            node.write_if_revision(&k, seed, json!(i)).await.unwrap()
        }));
    }
    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().is_applied() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(
        fleet.store.stored_revision(&k),
        Some(seed.next())
    );
}

// ============================================================================
// READ YOUR WRITES
// ============================================================================

#[tokio::test]
async fn write_then_read_returns_payload_with_cache() {
    let fleet = Fleet::new(2, Duration::from_millis(100));
    let node = fleet.node("a");
    let k = key("levels");
    node.write(&k, json!({"level": 12})).await.unwrap();
    assert_eq!(node.read(&k).await.unwrap().unwrap().payload, json!({"level": 12}));
}

#[tokio::test]
async fn write_then_read_returns_payload_without_cache() {
    let fleet = Fleet::new(2, Duration::from_millis(100));
    fleet.cache.set_reachable(false);
    let writer = fleet.node("a");
    let reader = fleet.node("b");
    let k = key("levels");

    writer.write(&k, json!({"level": 12})).await.unwrap();
    assert_eq!(writer.read(&k).await.unwrap().unwrap().payload, json!({"level": 12}));
    assert_eq!(reader.read(&k).await.unwrap().unwrap().payload, json!({"level": 12}));
    assert!(writer.is_degraded());
    assert!(reader.is_degraded());
}

// ============================================================================
// DEGRADED MODE
// ============================================================================

#[tokio::test]
async fn every_operation_completes_with_cache_unreachable() {
    let fleet = Fleet::new(2, Duration::from_millis(100));
    fleet.cache.set_reachable(false);
    let node = fleet.node("a");
    let k = key("quests");

    let first = node.write(&k, json!("one")).await.unwrap();
    let outcome = node
        .write_if_revision(&k, first.revision, json!("two"))
        .await
        .unwrap();
    assert_eq!(assertions::assert_applied(&outcome).revision, Revision::new(2));
    assert_eq!(node.read(&k).await.unwrap().unwrap().payload, json!("two"));

    let stale = node
        .write_if_revision(&k, first.revision, json!("three"))
        .await
        .unwrap();
    assert!(!stale.is_applied());

    assert_eq!(node.delete(&k).await.unwrap(), Some(Revision::new(3)));
    assert!(node.read(&k).await.unwrap().is_none());
    assert!(node.stats().degraded_ops > 0);
    assert!(fleet.cache.is_empty());
}

/// Two nodes with listeners attached while the cache is down, so no
/// invalidation can reach either of them.
fn degraded_pair(fleet: &Fleet) -> (Arc<Node>, Arc<Node>, watch::Sender<bool>) {
    fleet.cache.set_reachable(false);
    let a = fleet.node("a");
    let b = fleet.node("b");
    let (tx, rx) = watch::channel(false);
    a.spawn_invalidation_listener(rx.clone());
    b.spawn_invalidation_listener(rx);
    (a, b, tx)
}

#[tokio::test]
async fn degraded_read_sees_peer_write() {
    let fleet = Fleet::new(4, Duration::from_millis(100));
    let (a, b, shutdown) = degraded_pair(&fleet);
    let k = key("wardrobe");

    b.write(&k, json!("v1")).await.unwrap();
    assert_eq!(a.read(&k).await.unwrap().unwrap().payload, json!("v1"));

    b.write(&k, json!("v2")).await.unwrap();
    let seen = a.read(&k).await.unwrap().unwrap();
    assert_eq!(seen.payload, json!("v2"));
    assert_eq!(seen.revision, Revision::new(2));
    assert!(a.is_degraded());
    assert_eq!(a.stats().local_hits, 0);

    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn degraded_read_sees_peer_delete() {
    let fleet = Fleet::new(4, Duration::from_millis(100));
    let (a, b, shutdown) = degraded_pair(&fleet);
    let k = key("wardrobe");

    b.write(&k, json!("hat")).await.unwrap();
    assert!(a.read(&k).await.unwrap().is_some());

    b.delete(&k).await.unwrap();
    assert!(a.read(&k).await.unwrap().is_none());
    assert_eq!(a.stats().local_hits, 0);

    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn outage_clears_what_a_listening_node_held() {
    let fleet = Fleet::new(4, Duration::from_millis(100));
    let a = fleet.node("a");
    let b = fleet.node("b");
    let (shutdown, rx) = watch::channel(false);
    a.spawn_invalidation_listener(rx);
    assert!(eventually(|| a.is_listening()).await);

    let k = key("wardrobe");
    b.write(&k, json!("v1")).await.unwrap();
    a.read(&k).await.unwrap();
    a.read(&k).await.unwrap();
    assert_eq!(a.stats().local_hits, 1);

    // b's broadcast of v2 is lost; a learns of the outage on its next cache call.
    fleet.cache.set_reachable(false);
    b.write(&k, json!("v2")).await.unwrap();
    assert!(a.check_cache().await.is_none());
    assert_eq!(a.read(&k).await.unwrap().unwrap().payload, json!("v2"));
    assert_eq!(a.stats().local_hits, 1);

    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn store_failures_surface_verbatim() {
    let fleet = Fleet::new(2, Duration::from_millis(100));
    let node = fleet.node("a");
    let k = key("quests");
    fleet.store.set_unavailable(true);

    let err = node.write(&k, json!(1)).await.unwrap_err();
    assert!(matches!(err, StorageError::Unavailable { .. }));
    assert!(fleet.cache.peek(&k).is_none());
    assert_eq!(fleet.cache.published_count(), 0);
}

// ============================================================================
// TOMBSTONES
// ============================================================================

#[tokio::test]
async fn delete_then_read_is_absent_everywhere() {
    let fleet = Fleet::new(4, Duration::from_millis(100));
    let a = fleet.node("a");
    let b = fleet.node("b");
    let k = key("cosmetics");

    a.write(&k, json!("hat")).await.unwrap();
    assert!(b.read(&k).await.unwrap().is_some());

    let tombstone = a.delete(&k).await.unwrap().unwrap();
    assert!(a.read(&k).await.unwrap().is_none());

    let deleted = InvalidationMessage::deleted(k.clone(), tombstone, "a");
    assert!(b.apply_invalidation(&deleted));
    assert!(b.read(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn late_invalidation_does_not_resurrect() {
    let fleet = Fleet::new(4, Duration::from_millis(100));
    let a = fleet.node("a");
    let b = fleet.node("b");
    let k = key("cosmetics");

    let written = a.write(&k, json!("hat")).await.unwrap();
    let tombstone = a.delete(&k).await.unwrap().unwrap();

    b.apply_invalidation(&InvalidationMessage::deleted(k.clone(), tombstone, "a"));
    let late = InvalidationMessage::updated(k.clone(), written.revision, "a");
    assert!(!b.apply_invalidation(&late));
    assert!(b.read(&k).await.unwrap().is_none());

    // A stale cache entry below the tombstone is not served either.
    fleet.cache.insert_raw(
        nexus_core::CacheEntry::from_record(&written),
        Duration::from_secs(60),
    );
    assert!(b.read(&k).await.unwrap().is_none());
    assert!(a.read(&k).await.unwrap().is_none());
}

#[tokio::test]
async fn recreated_key_outranks_tombstone() {
    let fleet = Fleet::new(2, Duration::from_millis(100));
    let node = fleet.node("a");
    let k = key("cosmetics");
    node.write(&k, json!("hat")).await.unwrap();
    let tombstone = node.delete(&k).await.unwrap().unwrap();

    let outcome = node
        .write_if_revision(&k, Revision::ZERO, json!("cape"))
        .await
        .unwrap();
    let record = outcome.into_applied().unwrap();
    assert!(record.revision > tombstone);
    assert_eq!(node.read(&k).await.unwrap().unwrap().payload, json!("cape"));
}

// ============================================================================
// INVALIDATION LISTENER
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_propagates_remote_writes() {
    let fleet = Fleet::new(4, Duration::from_millis(200));
    let a = fleet.node("a");
    let b = fleet.node("b");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = b.spawn_invalidation_listener(shutdown_rx).unwrap();

    // Let the listener subscribe before the first write.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let k = key("levels");
    a.write(&k, json!(1)).await.unwrap();
    assert!(eventually(|| b.stats().invalidations_applied >= 1).await);
    assert_eq!(b.read(&k).await.unwrap().unwrap().payload, json!(1));

    a.write(&k, json!(2)).await.unwrap();
    assert!(eventually(|| b.stats().invalidations_applied >= 2).await);
    assert_eq!(b.read(&k).await.unwrap().unwrap().payload, json!(2));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_survives_cache_outage() {
    let fleet = Fleet::new(4, Duration::from_millis(200));
    fleet.cache.set_reachable(false);
    let b = fleet.node("b");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = b.spawn_invalidation_listener(shutdown_rx).unwrap();

    assert!(eventually(|| b.is_degraded()).await);
    fleet.cache.set_reachable(true);

    let a = fleet.node("a");
    let k = key("levels");
    // Keep writing until the resubscribed listener sees one.
    let mut seen = false;
    for i in 0..50 {
        a.write(&k, json!(i)).await.unwrap();
        if b.stats().invalidations_applied > 0 {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(seen);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), listener)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// POOL BOUND
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn third_read_waits_for_a_free_connection() {
    let fleet = Fleet::new(2, Duration::from_millis(50));
    fleet.store.set_latency(Duration::from_millis(10));
    let k = key("levels");
    fleet.store.write(&k, &json!(1)).await.unwrap();

    let started = Instant::now();
    let reads: Vec<_> = (0..3)
        .map(|_| {
            let store = fleet.store.clone();
            let k = k.clone();
            tokio::spawn(async move { store.fetch(&k).await })
        })
        .collect();
    for read in reads {
        assert!(read.await.unwrap().unwrap().is_some());
    }

    assert!(fleet.store.peak_in_flight() <= 2);
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn third_read_fails_after_wait_timeout() {
    let fleet = Fleet::new(2, Duration::from_millis(50));
    let k = key("levels");
    fleet.store.write(&k, &json!(1)).await.unwrap();
    fleet.store.set_latency(Duration::from_millis(300));

    let reads: Vec<_> = (0..3)
        .map(|_| {
            let store = fleet.store.clone();
            let k = k.clone();
            tokio::spawn(async move { store.fetch(&k).await })
        })
        .collect();

    let mut failed = Vec::new();
    for read in reads {
        let result = read.await.unwrap();
        if result.is_err() {
            failed.push(result);
        }
    }
    assert_eq!(failed.len(), 1);
    assertions::assert_pool_exhausted(&failed[0]);
    assert!(matches!(
        &failed[0],
        Err(StorageError::PoolExhausted { waited }) if *waited == Duration::from_millis(50)
    ));
    assert!(fleet.store.peak_in_flight() <= 2);
}
