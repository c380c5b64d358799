//! Shared cache with an invalidation channel.
//!
//! The cache is a fast, lossy copy of the store. Entries carry their revision
//! and [`SharedCache::set`] never replaces an entry with a lower or equal
//! revision, so a slow reader cannot overwrite a newer value it raced with.
//! Tombstone entries (no payload) shadow older values after a delete.

use async_trait::async_trait;
use nexus_core::{CacheEntry, CacheResult, InvalidationMessage, StateKey};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod memory;
pub mod redis;

pub use self::memory::InMemorySharedCache;
pub use self::redis::RedisSharedCache;

/// Buffered invalidations per subscription before the forwarder applies
/// backpressure.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Shared cache backend.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &StateKey) -> CacheResult<Option<CacheEntry>>;

    /// Store `entry` for `ttl` unless an entry with a revision at least as high
    /// is already cached. Returns whether the entry was stored.
    async fn set(&self, entry: &CacheEntry, ttl: Duration) -> CacheResult<bool>;

    async fn remove(&self, key: &StateKey) -> CacheResult<()>;

    /// Broadcast on the invalidation channel.
    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()>;

    /// Open a subscription to the invalidation channel. The subscription ends
    /// (yields `None`) when the underlying connection is lost.
    async fn subscribe(&self) -> CacheResult<InvalidationSubscription>;

    /// Round trip to the cache.
    async fn ping(&self) -> CacheResult<Duration>;
}

/// Stream of invalidation messages from one subscription.
///
/// Dropping it stops the forwarding task and releases the connection.
pub struct InvalidationSubscription {
    receiver: mpsc::Receiver<InvalidationMessage>,
    forwarder: JoinHandle<()>,
}

impl InvalidationSubscription {
    pub fn new(receiver: mpsc::Receiver<InvalidationMessage>, forwarder: JoinHandle<()>) -> Self {
        Self {
            receiver,
            forwarder,
        }
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<InvalidationMessage> {
        self.receiver.recv().await
    }
}

impl Drop for InvalidationSubscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl std::fmt::Debug for InvalidationSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationSubscription")
            .field("finished", &self.forwarder.is_finished())
            .finish()
    }
}
