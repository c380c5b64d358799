//! NEXUS Core - Shared Data Types
//!
//! Pure data structures with no I/O. Every other NEXUS crate depends on this.
//!
//! - [`state`]: synchronized state records, cache entries, invalidation messages
//! - [`version`]: host version tags and the patterns adapter bindings match on
//! - [`error`]: error enums for every layer
//! - [`config`]: configuration loaded from TOML or the environment

pub mod config;
pub mod error;
pub mod state;
pub mod version;

pub use config::{
    BindingConfig, BridgeConfig, NexusConfig, SharedCacheConfig, StoreConfig, SyncConfig,
};
pub use error::{
    BridgeError, BridgeResult, CacheError, CacheResult, ConfigError, NexusError, NexusResult,
    StorageError, StorageResult, ValidationError,
};
pub use state::{
    CacheEntry, InvalidationKind, InvalidationMessage, NodeId, Revision, StateKey, StateRecord,
    WriteOutcome,
};
pub use version::{HostVersionTag, VersionPattern};

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Entity identifier. Player UUIDs, island ids and the like.
pub type EntityId = uuid::Uuid;
