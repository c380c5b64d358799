//! Configuration types
//!
//! Every section can be read from a TOML document ([`NexusConfig::from_toml_str`])
//! or from `NEXUS_*` environment variables ([`NexusConfig::from_env`]). Both
//! paths end in [`NexusConfig::validate`].

use crate::error::ConfigError;
use crate::state::NodeId;
use crate::version::{HostVersionTag, VersionPattern};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

static SQL_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("static identifier regex"));

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, field: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value: raw,
            reason: format!("could not parse {}", name),
        }),
        None => Ok(None),
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Durable store connection and pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Maximum concurrently checked-out connections.
    pub pool_size: usize,
    /// How long a caller queues for a free connection before `PoolExhausted`.
    pub wait_timeout_ms: u64,
    /// Timeout for opening a new physical connection.
    pub create_timeout_ms: u64,
    /// Name of the state table.
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "nexus".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            pool_size: 10,
            wait_timeout_ms: 2_000,
            create_timeout_ms: 5_000,
            table: "nexus_state".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = env_string("NEXUS_DB_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse("NEXUS_DB_PORT", "store.port")? {
            self.port = port;
        }
        if let Some(dbname) = env_string("NEXUS_DB_NAME") {
            self.dbname = dbname;
        }
        if let Some(user) = env_string("NEXUS_DB_USER") {
            self.user = user;
        }
        if let Some(password) = env_string("NEXUS_DB_PASSWORD") {
            self.password = password;
        }
        if let Some(size) = env_parse("NEXUS_DB_POOL_SIZE", "store.pool_size")? {
            self.pool_size = size;
        }
        if let Some(ms) = env_parse("NEXUS_DB_WAIT_TIMEOUT_MS", "store.wait_timeout_ms")? {
            self.wait_timeout_ms = ms;
        }
        if let Some(table) = env_string("NEXUS_DB_TABLE") {
            self.table = table;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "store.host".to_string(),
            });
        }
        if self.pool_size == 0 {
            return Err(invalid("store.pool_size", self.pool_size, "must be at least 1"));
        }
        if self.wait_timeout_ms == 0 {
            return Err(invalid(
                "store.wait_timeout_ms",
                self.wait_timeout_ms,
                "must be greater than zero",
            ));
        }
        if !SQL_IDENTIFIER.is_match(&self.table) {
            return Err(invalid(
                "store.table",
                &self.table,
                "must be a plain SQL identifier",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SHARED CACHE
// ============================================================================

/// Shared cache endpoint and invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    /// When false the sync layer runs permanently on the store alone.
    pub enabled: bool,
    pub url: String,
    /// Pub/sub channel carrying invalidation messages.
    pub channel: String,
    /// Prefix for every cache key.
    pub key_prefix: String,
    pub ttl_secs: u64,
    /// Upper bound for any single cache round trip.
    pub op_timeout_ms: u64,
    /// Delay before the subscriber reconnects after losing its connection.
    pub reconnect_backoff_ms: u64,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379/0".to_string(),
            channel: "nexus:invalidate".to_string(),
            key_prefix: "nexus:state:".to_string(),
            ttl_secs: 300,
            op_timeout_ms: 250,
            reconnect_backoff_ms: 2_000,
        }
    }
}

impl SharedCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(enabled) = env_string("NEXUS_CACHE_ENABLED") {
            self.enabled = !matches!(enabled.to_lowercase().as_str(), "false" | "0" | "no");
        }
        if let Some(url) = env_string("NEXUS_CACHE_URL") {
            self.url = url;
        }
        if let Some(channel) = env_string("NEXUS_CACHE_CHANNEL") {
            self.channel = channel;
        }
        if let Some(ttl) = env_parse("NEXUS_CACHE_TTL_SECS", "cache.ttl_secs")? {
            self.ttl_secs = ttl;
        }
        if let Some(ms) = env_parse("NEXUS_CACHE_OP_TIMEOUT_MS", "cache.op_timeout_ms")? {
            self.op_timeout_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache.url".to_string(),
            });
        }
        if self.channel.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache.channel".to_string(),
            });
        }
        if self.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", self.ttl_secs, "must be greater than zero"));
        }
        if self.op_timeout_ms == 0 {
            return Err(invalid(
                "cache.op_timeout_ms",
                self.op_timeout_ms,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SYNC
// ============================================================================

/// Per-process settings of the sync service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifier stamped on every invalidation this process publishes.
    pub node_id: NodeId,
    /// How long a record stays in the in-process view.
    pub local_ttl_ms: u64,
    /// Entries kept in the in-process view before new ones bypass it.
    pub local_capacity: usize,
    /// Broadcasts queued while the shared cache is unreachable, one per key.
    pub pending_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4().simple()),
            local_ttl_ms: 30_000,
            local_capacity: 50_000,
            pending_capacity: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn with_node_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(node_id) = env_string("NEXUS_NODE_ID") {
            self.node_id = node_id;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "sync.node_id".to_string(),
            });
        }
        for (field, value) in [
            ("sync.local_capacity", self.local_capacity),
            ("sync.pending_capacity", self.pending_capacity),
        ] {
            if value == 0 {
                return Err(invalid(field, value, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// BRIDGE
// ============================================================================

/// One row of the binding table: versions matching `pattern` use `adapter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub pattern: VersionPattern,
    pub adapter: String,
}

/// Adapter selection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Skip the probe and use this version.
    pub host_version: Option<HostVersionTag>,
    /// Replaces the built-in binding table when non-empty.
    pub bindings: Vec<BindingConfig>,
}

impl BridgeConfig {
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(raw) = env_string("NEXUS_HOST_VERSION") {
            let tag = raw
                .parse()
                .map_err(|e| invalid("bridge.host_version", &raw, &format!("{}", e)))?;
            self.host_version = Some(tag);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for binding in &self.bindings {
            if binding.adapter.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: format!("bridge.bindings[{}].adapter", binding.pattern),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Master configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    pub store: StoreConfig,
    pub cache: SharedCacheConfig,
    pub sync: SyncConfig,
    pub bridge: BridgeConfig,
}

impl NexusConfig {
    /// Defaults overridden by `NEXUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.store.apply_env()?;
        config.cache.apply_env()?;
        config.sync.apply_env()?;
        config.bridge.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.cache.validate()?;
        self.sync.validate()?;
        self.bridge.validate()?;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
