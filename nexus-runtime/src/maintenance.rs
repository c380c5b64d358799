//! Maintenance Background Task
//!
//! Periodic upkeep for a running node:
//!
//! - Cache health probe: pings the shared cache so a node that went degraded
//!   notices recovery (and flushes its queued broadcasts) even when no reads
//!   or writes arrive.
//! - Tombstone purge: removes store rows deleted longer ago than the
//!   retention window. The sync service clamps the horizon so nothing younger
//!   than the cache TTL goes.

use nexus_core::ConfigError;
use nexus_storage::{SharedCache, StateStore, StateSyncService};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

pub const DEFAULT_CACHE_CHECK_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_TOMBSTONE_PURGE_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_TOMBSTONE_RETENTION_SECS: u64 = 7 * 24 * 3600;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often to ping the shared cache (default: 15 seconds)
    pub cache_check_interval_secs: u64,

    /// How often to purge tombstones (default: 1 hour)
    pub tombstone_purge_interval_secs: u64,

    /// Tombstones younger than this are kept (default: 7 days)
    pub tombstone_retention_secs: u64,

    /// Set to false to run no maintenance at all
    pub enabled: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cache_check_interval_secs: DEFAULT_CACHE_CHECK_INTERVAL_SECS,
            tombstone_purge_interval_secs: DEFAULT_TOMBSTONE_PURGE_INTERVAL_SECS,
            tombstone_retention_secs: DEFAULT_TOMBSTONE_RETENTION_SECS,
            enabled: true,
        }
    }
}

impl MaintenanceConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    /// - `NEXUS_MAINT_CACHE_CHECK_SECS`
    /// - `NEXUS_MAINT_PURGE_INTERVAL_SECS`
    /// - `NEXUS_MAINT_TOMBSTONE_RETENTION_SECS`
    /// - `NEXUS_MAINT_ENABLED`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = env_secs("NEXUS_MAINT_CACHE_CHECK_SECS")? {
            config.cache_check_interval_secs = secs;
        }
        if let Some(secs) = env_secs("NEXUS_MAINT_PURGE_INTERVAL_SECS")? {
            config.tombstone_purge_interval_secs = secs;
        }
        if let Some(secs) = env_secs("NEXUS_MAINT_TOMBSTONE_RETENTION_SECS")? {
            config.tombstone_retention_secs = secs;
        }
        if let Ok(enabled) = std::env::var("NEXUS_MAINT_ENABLED") {
            config.enabled = !matches!(enabled.to_lowercase().as_str(), "false" | "0" | "no");
        }
        config.validate()?;
        Ok(config)
    }

    pub fn cache_check_interval(&self) -> Duration {
        Duration::from_secs(self.cache_check_interval_secs)
    }

    pub fn tombstone_purge_interval(&self) -> Duration {
        Duration::from_secs(self.tombstone_purge_interval_secs)
    }

    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("maintenance.cache_check_interval_secs", self.cache_check_interval_secs),
            ("maintenance.tombstone_purge_interval_secs", self.tombstone_purge_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_secs(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    field: name.to_string(),
                    value: raw,
                    reason: "expected whole seconds".to_string(),
                })
        }
        _ => Ok(None),
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub cache_checks: AtomicU64,
    pub cache_check_failures: AtomicU64,
    pub purge_cycles: AtomicU64,
    pub tombstones_purged: AtomicU64,
    pub purge_errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            cache_checks: self.cache_checks.load(Ordering::Relaxed),
            cache_check_failures: self.cache_check_failures.load(Ordering::Relaxed),
            purge_cycles: self.purge_cycles.load(Ordering::Relaxed),
            tombstones_purged: self.tombstones_purged.load(Ordering::Relaxed),
            purge_errors: self.purge_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub cache_checks: u64,
    pub cache_check_failures: u64,
    pub purge_cycles: u64,
    pub tombstones_purged: u64,
    pub purge_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run maintenance until `shutdown_rx` flips to `true`.
///
/// Both timers fire once immediately, so a node starting in degraded mode
/// gets its first probe right away.
pub async fn maintenance_task<S, C>(
    sync: Arc<StateSyncService<S, C>>,
    config: MaintenanceConfig,
    metrics: Arc<MaintenanceMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: StateStore,
    C: SharedCache,
{
    let mut cache_interval = interval(config.cache_check_interval());
    cache_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut purge_interval = interval(config.tombstone_purge_interval());
    purge_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        node_id = %sync.node_id(),
        cache_check_interval_secs = config.cache_check_interval_secs,
        tombstone_retention_secs = config.tombstone_retention_secs,
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = cache_interval.tick() => {
                check_cache(&sync, &metrics).await;
            }

            _ = purge_interval.tick() => {
                purge_tombstones(&sync, &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cache_checks = snapshot.cache_checks,
        cache_check_failures = snapshot.cache_check_failures,
        tombstones_purged = snapshot.tombstones_purged,
        purge_errors = snapshot.purge_errors,
        "Maintenance task stopped"
    );
}

async fn check_cache<S, C>(sync: &StateSyncService<S, C>, metrics: &MaintenanceMetrics)
where
    S: StateStore,
    C: SharedCache,
{
    if sync.cache().is_none() {
        return;
    }
    metrics.cache_checks.fetch_add(1, Ordering::Relaxed);
    match sync.check_cache().await {
        Some(latency) => {
            tracing::trace!(latency_ms = latency.as_millis() as u64, "cache ping");
        }
        None => {
            metrics.cache_check_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn purge_tombstones<S, C>(
    sync: &StateSyncService<S, C>,
    config: &MaintenanceConfig,
    metrics: &MaintenanceMetrics,
) where
    S: StateStore,
    C: SharedCache,
{
    metrics.purge_cycles.fetch_add(1, Ordering::Relaxed);
    let retention = chrono::Duration::from_std(config.tombstone_retention())
        .unwrap_or_else(|_| chrono::Duration::days(7));
    let horizon = chrono::Utc::now() - retention;

    match sync.purge_tombstones(horizon).await {
        Ok(0) => tracing::trace!("tombstone purge found nothing"),
        Ok(purged) => {
            metrics.tombstones_purged.fetch_add(purged, Ordering::Relaxed);
            tracing::info!(purged, horizon = %horizon, "tombstones purged");
        }
        Err(e) => {
            metrics.purge_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "tombstone purge failed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_test_utils::fixtures;
    use serde_json::json;

    fn quick_config() -> MaintenanceConfig {
        MaintenanceConfig {
            cache_check_interval_secs: 1,
            tombstone_purge_interval_secs: 1,
            tombstone_retention_secs: 0,
            enabled: true,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(MaintenanceConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_first_tick_probes_and_purges() {
        let store = fixtures::memory_store(2, Duration::from_millis(200));
        let cache = fixtures::memory_cache();
        let node = fixtures::memory_node(&store, &cache, "maint");
        let key = fixtures::state_key("maint");
        node.write(&key, json!({"v": 1})).await.unwrap();
        node.delete(&key).await.unwrap();

        let metrics = Arc::new(MaintenanceMetrics::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(maintenance_task(
            Arc::clone(&node),
            quick_config(),
            Arc::clone(&metrics),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache_checks, 1);
        assert_eq!(snapshot.cache_check_failures, 0);
        assert_eq!(snapshot.purge_cycles, 1);
        assert_eq!(snapshot.purge_errors, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_is_counted() {
        let store = fixtures::memory_store(2, Duration::from_millis(200));
        let cache = fixtures::memory_cache();
        cache.set_reachable(false);
        let node = fixtures::memory_node(&store, &cache, "maint");
        let metrics = MaintenanceMetrics::new();

        check_cache(&node, &metrics).await;
        assert_eq!(metrics.snapshot().cache_check_failures, 1);
        assert!(node.is_degraded());
    }
}
