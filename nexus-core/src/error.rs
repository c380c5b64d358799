//! Error types for NEXUS operations

use crate::version::HostVersionTag;
use std::time::Duration;
use thiserror::Error;

/// Runtime bridge errors: adapter resolution and host calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Host version {version} is not supported by any adapter binding")]
    UnsupportedHostVersion { version: HostVersionTag },

    #[error("Host version {version} matches more than one adapter binding: {adapters:?}")]
    AmbiguousHostVersion {
        version: HostVersionTag,
        adapters: Vec<String>,
    },

    #[error("Adapter binding refers to unknown adapter: {adapter}")]
    UnknownAdapter { adapter: String },

    #[error("Adapter {adapter} failed to initialize: {reason}")]
    AdapterInitFailed { adapter: String, reason: String },

    #[error("Adapter already resolved for {active}, refusing to resolve again for {requested}")]
    AlreadyResolved {
        active: HostVersionTag,
        requested: HostVersionTag,
    },

    #[error("No adapter has been resolved yet")]
    NotResolved,

    #[error("Host version probe failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("Host operation {operation} failed: {cause}")]
    HostOperationFailed { operation: String, cause: String },

    #[error("Invalid argument for {operation}: {reason}")]
    InvalidArgument { operation: String, reason: String },
}

impl BridgeError {
    /// Startup-fatal errors abort plugin activation.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::UnsupportedHostVersion { .. }
                | BridgeError::AmbiguousHostVersion { .. }
                | BridgeError::UnknownAdapter { .. }
                | BridgeError::AdapterInitFailed { .. }
                | BridgeError::ProbeFailed { .. }
        )
    }
}

/// Durable store and connection pool errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Failed to open store connection: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Store {operation} failed: {reason}")]
    QueryFailed { operation: String, reason: String },

    #[error("Schema bootstrap failed: {reason}")]
    SchemaFailed { reason: String },

    #[error("Corrupt record for key {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StorageError {
    /// Whether a caller may retry the same call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::PoolExhausted { .. }
                | StorageError::ConnectionFailed { .. }
                | StorageError::Unavailable { .. }
        )
    }
}

/// Shared cache errors. These never escape the sync service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Shared cache unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Shared cache {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Failed to encode cache payload: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode cache payload: {reason}")]
    Decode { reason: String },

    #[error("Shared cache is shut down")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Validation errors for keys, versions and patterns.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid state key {raw:?}: {reason}")]
    InvalidKey { raw: String, reason: String },

    #[error("Invalid host version {raw:?}: {reason}")]
    InvalidVersion { raw: String, reason: String },

    #[error("Invalid version pattern {raw:?}: {reason}")]
    InvalidPattern { raw: String, reason: String },
}

/// Master error type for all NEXUS errors.
#[derive(Debug, Clone, Error)]
pub enum NexusError {
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type alias for NEXUS operations.
pub type NexusResult<T> = Result<T, NexusError>;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type alias for store and pool operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for shared cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
