//! NEXUS Storage - Durable Store, Shared Cache and State Synchronization
//!
//! Layering, leaf first:
//!
//! - [`pool`]: bounded connection pool with a checkout wait timeout
//! - [`store`]: the authoritative [`StateStore`] (PostgreSQL, in-memory)
//! - [`cache`]: the [`SharedCache`] with its invalidation channel (Redis, in-memory)
//! - [`sync`]: [`StateSyncService`], which composes the two into one read/write API
//!
//! The store is always authoritative. The cache may be empty, stale within its
//! TTL, or unreachable, and every [`StateSyncService`] operation still
//! completes against the store.

pub mod cache;
pub mod pool;
pub mod store;
pub mod sync;

pub use cache::{
    InMemorySharedCache, InvalidationSubscription, RedisSharedCache, SharedCache,
};
pub use pool::{ConnectionPool, PoolStatus};
pub use store::{
    InMemoryStateStore, MemoryManager, PostgresStateStore, StateStore, StoreHealth,
};
pub use sync::{StateSyncService, SyncStats};
