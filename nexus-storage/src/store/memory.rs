//! In-memory state store.
//!
//! Behaves like the PostgreSQL store, including the bounded pool: every call
//! checks out a [`MemoryConnection`] and holds it for the whole operation,
//! plus an optional artificial latency. Used by tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use deadpool::managed::{Manager, Metrics, RecycleResult};
use nexus_core::{
    Revision, StateKey, StateRecord, StorageError, StorageResult, StoreConfig, Timestamp,
    WriteOutcome,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{StateStore, StoreHealth};
use crate::pool::{ConnectionPool, PoolStatus};

#[derive(Debug, Clone)]
struct MemoryRow {
    payload: Option<Value>,
    revision: Revision,
    updated_at: Timestamp,
}

impl MemoryRow {
    fn is_live(&self) -> bool {
        self.payload.is_some()
    }

    fn to_record(&self, key: &StateKey) -> Option<StateRecord> {
        Some(StateRecord {
            key: key.clone(),
            payload: self.payload.clone()?,
            revision: self.revision,
            updated_at: self.updated_at,
        })
    }
}

/// Shared backing table.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: DashMap<StateKey, MemoryRow>,
    unavailable: AtomicBool,
}

/// One checked-out handle to the backing table.
#[derive(Debug)]
pub struct MemoryConnection {
    table: Arc<MemoryTable>,
}

impl MemoryConnection {
    fn table(&self) -> StorageResult<&MemoryTable> {
        if self.table.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "in-memory store marked unavailable".to_string(),
            });
        }
        Ok(&self.table)
    }
}

/// Pool manager handing out [`MemoryConnection`]s.
#[derive(Debug)]
pub struct MemoryManager {
    table: Arc<MemoryTable>,
}

impl Manager for MemoryManager {
    type Type = MemoryConnection;
    type Error = StorageError;

    async fn create(&self) -> Result<MemoryConnection, StorageError> {
        Ok(MemoryConnection {
            table: self.table.clone(),
        })
    }

    async fn recycle(&self, _conn: &mut MemoryConnection, _: &Metrics) -> RecycleResult<StorageError> {
        Ok(())
    }
}

/// Counts operations currently holding a connection.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`StateStore`] behind a bounded [`ConnectionPool`].
pub struct InMemoryStateStore {
    pool: ConnectionPool<MemoryManager>,
    table: Arc<MemoryTable>,
    latency_us: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryStateStore {
    pub fn new(pool_size: usize, wait_timeout: Duration) -> StorageResult<Self> {
        let table = Arc::new(MemoryTable::default());
        let manager = MemoryManager {
            table: table.clone(),
        };
        let pool = ConnectionPool::new(manager, pool_size, wait_timeout, Duration::from_secs(1))?;
        Ok(Self {
            pool,
            table,
            latency_us: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &StoreConfig) -> StorageResult<Self> {
        Self::new(config.pool_size, config.wait_timeout())
    }

    /// Hold each checked-out connection this long before touching the table.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Fail every operation with `StorageError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.table.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Highest number of operations that ever ran at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Revision of the row for `key`, including tombstones.
    pub fn stored_revision(&self, key: &StateKey) -> Option<Revision> {
        self.table.rows.get(key).map(|row| row.revision)
    }

    pub fn row_count(&self) -> usize {
        self.table.rows.len()
    }

    async fn checkout(
        &self,
    ) -> StorageResult<(deadpool::managed::Object<MemoryManager>, InFlight<'_>)> {
        let conn = self.pool.get().await?;
        let flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let latency = Duration::from_micros(self.latency_us.load(Ordering::SeqCst));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok((conn, flight))
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn fetch(&self, key: &StateKey) -> StorageResult<Option<StateRecord>> {
        let (conn, _flight) = self.checkout().await?;
        let table = conn.table()?;
        Ok(table.rows.get(key).and_then(|row| row.to_record(key)))
    }

    async fn write(&self, key: &StateKey, payload: &Value) -> StorageResult<StateRecord> {
        let (conn, _flight) = self.checkout().await?;
        let table = conn.table()?;
        let now = Utc::now();

        let revision = match table.rows.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                row.revision = row.revision.next();
                row.payload = Some(payload.clone());
                row.updated_at = now;
                row.revision
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryRow {
                    payload: Some(payload.clone()),
                    revision: Revision::new(1),
                    updated_at: now,
                });
                Revision::new(1)
            }
        };

        Ok(StateRecord {
            key: key.clone(),
            payload: payload.clone(),
            revision,
            updated_at: now,
        })
    }

    async fn write_if_revision(
        &self,
        key: &StateKey,
        expected: Revision,
        payload: &Value,
    ) -> StorageResult<WriteOutcome> {
        let (conn, _flight) = self.checkout().await?;
        let table = conn.table()?;
        let now = Utc::now();

        let applied = match table.rows.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let row = occupied.get_mut();
                let matches = if row.is_live() {
                    row.revision == expected
                } else {
                    expected.is_zero()
                };
                if matches {
                    row.revision = row.revision.next();
                    row.payload = Some(payload.clone());
                    row.updated_at = now;
                    Some(row.revision)
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) if expected.is_zero() => {
                vacant.insert(MemoryRow {
                    payload: Some(payload.clone()),
                    revision: Revision::new(1),
                    updated_at: now,
                });
                Some(Revision::new(1))
            }
            Entry::Vacant(_) => None,
        };

        Ok(match applied {
            Some(revision) => WriteOutcome::Applied(StateRecord {
                key: key.clone(),
                payload: payload.clone(),
                revision,
                updated_at: now,
            }),
            None => WriteOutcome::RevisionConflict {
                key: key.clone(),
                expected,
            },
        })
    }

    async fn delete(&self, key: &StateKey) -> StorageResult<Option<Revision>> {
        let (conn, _flight) = self.checkout().await?;
        let table = conn.table()?;

        let tombstone = table.rows.get_mut(key).and_then(|mut row| {
            if !row.is_live() {
                return None;
            }
            row.revision = row.revision.next();
            row.payload = None;
            row.updated_at = Utc::now();
            Some(row.revision)
        });
        Ok(tombstone)
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        let (conn, _flight) = self.checkout().await?;
        conn.table()?;
        Ok(())
    }

    async fn purge_tombstones(&self, older_than: Timestamp) -> StorageResult<u64> {
        let (conn, _flight) = self.checkout().await?;
        let table = conn.table()?;
        let before = table.rows.len();
        table
            .rows
            .retain(|_, row| row.is_live() || row.updated_at >= older_than);
        Ok(before.saturating_sub(table.rows.len()) as u64)
    }

    async fn health(&self) -> StorageResult<StoreHealth> {
        let started = Instant::now();
        let (conn, _flight) = self.checkout().await?;
        conn.table()?;
        Ok(StoreHealth {
            latency: started.elapsed(),
            pool: self.pool.status(),
        })
    }

    fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    fn close(&self) {
        self.pool.close();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn key(ns: &str) -> StateKey {
        StateKey::new(Uuid::new_v4(), ns).unwrap()
    }

    fn store() -> InMemoryStateStore {
        InMemoryStateStore::new(4, Duration::from_millis(100)).unwrap()
    }

    #[tokio::test]
    async fn test_first_write_is_revision_one() {
        let store = store();
        let k = key("levels");
        let record = store.write(&k, &json!({"level": 3})).await.unwrap();
        assert_eq!(record.revision, Revision::new(1));

        let second = store.write(&k, &json!({"level": 4})).await.unwrap();
        assert_eq!(second.revision, Revision::new(2));
        assert_eq!(store.fetch(&k).await.unwrap().unwrap().payload, json!({"level": 4}));
    }

    #[tokio::test]
    async fn test_conditional_write_conflict_leaves_row_untouched() {
        let store = store();
        let k = key("economy");
        store.write(&k, &json!({"balance": 10})).await.unwrap();

        let outcome = store
            .write_if_revision(&k, Revision::new(5), &json!({"balance": 99}))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::RevisionConflict {
                key: k.clone(),
                expected: Revision::new(5)
            }
        );
        let current = store.fetch(&k).await.unwrap().unwrap();
        assert_eq!(current.revision, Revision::new(1));
        assert_eq!(current.payload, json!({"balance": 10}));

        let outcome = store
            .write_if_revision(&k, Revision::new(1), &json!({"balance": 20}))
            .await
            .unwrap();
        assert_eq!(outcome.applied().unwrap().revision, Revision::new(2));
    }

    #[tokio::test]
    async fn test_conditional_create_needs_zero() {
        let store = store();
        let k = key("economy");
        let conflict = store
            .write_if_revision(&k, Revision::new(1), &json!({}))
            .await
            .unwrap();
        assert!(!conflict.is_applied());
        assert_eq!(store.row_count(), 0);

        let created = store
            .write_if_revision(&k, Revision::ZERO, &json!({}))
            .await
            .unwrap();
        assert_eq!(created.applied().unwrap().revision, Revision::new(1));

        let again = store
            .write_if_revision(&k, Revision::ZERO, &json!({}))
            .await
            .unwrap();
        assert!(!again.is_applied());
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_recreate_continues_counting() {
        let store = store();
        let k = key("levels");
        store.write(&k, &json!(1)).await.unwrap();
        store.write(&k, &json!(2)).await.unwrap();

        assert_eq!(store.delete(&k).await.unwrap(), Some(Revision::new(3)));
        assert!(store.fetch(&k).await.unwrap().is_none());
        assert_eq!(store.delete(&k).await.unwrap(), None);
        assert_eq!(store.stored_revision(&k), Some(Revision::new(3)));

        let recreated = store
            .write_if_revision(&k, Revision::ZERO, &json!(3))
            .await
            .unwrap();
        assert_eq!(recreated.applied().unwrap().revision, Revision::new(4));
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_tombstones() {
        let store = store();
        let live = key("levels");
        let dead = key("levels");
        store.write(&live, &json!(1)).await.unwrap();
        store.write(&dead, &json!(1)).await.unwrap();
        store.delete(&dead).await.unwrap();

        let purged = store
            .purge_tombstones(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.row_count(), 1);
        assert!(store.fetch(&live).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = store();
        store.set_unavailable(true);
        let err = store.fetch(&key("levels")).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));
        assert!(err.is_retryable());
        assert!(store.health().await.is_err());

        store.set_unavailable(false);
        let health = store.health().await.unwrap();
        assert_eq!(health.pool.max_size, 4);
    }
}
