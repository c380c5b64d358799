//! Durable state store.
//!
//! One row per [`StateKey`] holding the payload, the revision and the last
//! write time. Every operation is a single round trip on one pooled
//! connection, released before the call returns.
//!
//! Deletes leave a tombstone row (no payload, revision bumped) so a key that
//! is written again keeps counting upwards. Tombstones read as absent and are
//! removed by [`StateStore::purge_tombstones`].

use async_trait::async_trait;
use nexus_core::{Revision, StateKey, StateRecord, StorageResult, Timestamp, WriteOutcome};
use serde_json::Value;
use std::time::Duration;

use crate::pool::PoolStatus;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryStateStore, MemoryManager};
pub use postgres::PostgresStateStore;

/// Result of a store health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    /// Round-trip time of the probe query.
    pub latency: Duration,
    pub pool: PoolStatus,
}

/// The authoritative store for synchronized state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the live record for `key`. Tombstones read as `None`.
    async fn fetch(&self, key: &StateKey) -> StorageResult<Option<StateRecord>>;

    /// Unconditional write. Creates the row at revision 1 or increments the
    /// current revision; concurrent writers always receive distinct revisions.
    async fn write(&self, key: &StateKey, payload: &Value) -> StorageResult<StateRecord>;

    /// Compare-and-increment write.
    ///
    /// Applies only if the stored live revision equals `expected`
    /// ([`Revision::ZERO`] matches a missing or deleted key). On conflict the
    /// row is untouched.
    async fn write_if_revision(
        &self,
        key: &StateKey,
        expected: Revision,
        payload: &Value,
    ) -> StorageResult<WriteOutcome>;

    /// Tombstone the key. Returns the tombstone revision, or `None` if there
    /// was no live record.
    async fn delete(&self, key: &StateKey) -> StorageResult<Option<Revision>>;

    /// Create the state table if it does not exist.
    async fn ensure_schema(&self) -> StorageResult<()>;

    /// Physically remove tombstones last written before `older_than`.
    ///
    /// The horizon must lie further back than the shared cache TTL, otherwise a
    /// recreated key could restart below a still-cached revision.
    async fn purge_tombstones(&self, older_than: Timestamp) -> StorageResult<u64>;

    /// Probe the store with a trivial round trip.
    async fn health(&self) -> StorageResult<StoreHealth>;

    /// Current pool occupancy.
    fn pool_status(&self) -> PoolStatus;

    /// Stop handing out connections.
    fn close(&self);
}
