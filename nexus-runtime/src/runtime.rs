//! Process lifecycle.
//!
//! Startup order is fixed: host version -> adapter -> store pool -> schema ->
//! shared cache -> sync service -> background tasks. Any failure up to and
//! including the schema aborts startup; a cache that cannot be reached only
//! puts the node in degraded mode.

use nexus_bridge::{probe_host_version, HostAdapter, HostConnection, VersionAdapterRegistry};
use nexus_core::{HostVersionTag, NexusError, NexusResult};
use nexus_storage::{
    PostgresStateStore, RedisSharedCache, SharedCache, StateStore, StateSyncService, StoreHealth,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::maintenance::{maintenance_task, MaintenanceMetrics, MaintenanceSnapshot};

/// Runtime over the production PostgreSQL store and Redis cache.
pub type ProductionRuntime = NexusRuntime<PostgresStateStore, RedisSharedCache>;

/// Point-in-time view of a running node.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub adapter: &'static str,
    pub host_version: HostVersionTag,
    pub store: Result<StoreHealth, String>,
    /// Cache round trip, or `None` when the cache is disabled or unreachable.
    pub cache_latency: Option<Duration>,
    pub degraded: bool,
    pub pending_broadcasts: usize,
}

impl RuntimeHealth {
    pub fn is_healthy(&self) -> bool {
        self.store.is_ok()
    }
}

/// A started node: the resolved host adapter, the sync service and the
/// background tasks feeding them.
pub struct NexusRuntime<S, C>
where
    S: StateStore + 'static,
    C: SharedCache + 'static,
{
    registry: VersionAdapterRegistry,
    adapter: Arc<dyn HostAdapter>,
    sync: Arc<StateSyncService<S, C>>,
    shutdown_tx: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    maintenance_metrics: Arc<MaintenanceMetrics>,
}

impl ProductionRuntime {
    /// Start against PostgreSQL and Redis as configured.
    pub async fn start(
        config: RuntimeConfig,
        host: Arc<dyn HostConnection>,
    ) -> NexusResult<Self> {
        config.validate()?;
        // Resolve before opening anything, so an unsupported host leaves no pool behind.
        let (registry, adapter) = resolve_adapter(&config, host).await?;

        let store = Arc::new(PostgresStateStore::connect(&config.nexus.store)?);
        let cache = if config.nexus.cache.enabled {
            Some(Arc::new(RedisSharedCache::new(config.nexus.cache.clone())?))
        } else {
            None
        };
        Self::wire(config, registry, adapter, store, cache).await
    }
}

impl<S, C> NexusRuntime<S, C>
where
    S: StateStore + 'static,
    C: SharedCache + 'static,
{
    /// Start with caller-supplied store and cache.
    pub async fn assemble(
        config: RuntimeConfig,
        host: Arc<dyn HostConnection>,
        store: Arc<S>,
        cache: Option<Arc<C>>,
    ) -> NexusResult<Self> {
        config.validate()?;
        let (registry, adapter) = resolve_adapter(&config, host).await?;
        Self::wire(config, registry, adapter, store, cache).await
    }

    async fn wire(
        config: RuntimeConfig,
        registry: VersionAdapterRegistry,
        adapter: Arc<dyn HostAdapter>,
        store: Arc<S>,
        cache: Option<Arc<C>>,
    ) -> NexusResult<Self> {
        if let Err(e) = store.ensure_schema().await {
            tracing::error!(error = %e, "state schema bootstrap failed");
            store.close();
            return Err(e.into());
        }

        let sync = Arc::new(StateSyncService::new(
            store,
            cache,
            config.nexus.sync.clone(),
            &config.nexus.cache,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = sync.spawn_invalidation_listener(shutdown_rx.clone());

        let maintenance_metrics = Arc::new(MaintenanceMetrics::new());
        let maintenance = if config.maintenance.enabled {
            Some(tokio::spawn(maintenance_task(
                Arc::clone(&sync),
                config.maintenance.clone(),
                Arc::clone(&maintenance_metrics),
                shutdown_rx,
            )))
        } else {
            None
        };

        tracing::info!(
            node_id = %sync.node_id(),
            adapter = adapter.id(),
            host_version = %adapter.version(),
            shared_cache = sync.cache().is_some(),
            "NEXUS runtime started"
        );

        Ok(Self {
            registry,
            adapter,
            sync,
            shutdown_tx,
            listener,
            maintenance,
            maintenance_metrics,
        })
    }

    /// The adapter every feature module talks to the host through.
    pub fn adapter(&self) -> Arc<dyn HostAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn registry(&self) -> &VersionAdapterRegistry {
        &self.registry
    }

    pub fn sync(&self) -> Arc<StateSyncService<S, C>> {
        Arc::clone(&self.sync)
    }

    pub fn maintenance_stats(&self) -> MaintenanceSnapshot {
        self.maintenance_metrics.snapshot()
    }

    pub async fn health(&self) -> RuntimeHealth {
        let store = self.sync.store().health().await.map_err(|e| e.to_string());
        let cache_latency = self.sync.check_cache().await;
        RuntimeHealth {
            adapter: self.adapter.id(),
            host_version: self.adapter.version(),
            store,
            cache_latency,
            degraded: self.sync.is_degraded(),
            pending_broadcasts: self.sync.pending_broadcasts(),
        }
    }

    /// Stop background tasks, which drops the cache subscription, then close
    /// the store pool.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        for (task, handle) in [
            ("invalidation listener", self.listener.take()),
            ("maintenance", self.maintenance.take()),
        ] {
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    tracing::warn!(task, error = %e, "background task ended abnormally");
                }
            }
        }

        self.sync.store().close();
        tracing::info!(node_id = %self.sync.node_id(), "NEXUS runtime stopped");
    }
}

impl<S, C> fmt::Debug for NexusRuntime<S, C>
where
    S: StateStore + 'static,
    C: SharedCache + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NexusRuntime")
            .field("node_id", &self.sync.node_id())
            .field("adapter", &self.adapter.id())
            .field("host_version", &self.adapter.version())
            .field("listener", &self.listener.is_some())
            .field("maintenance", &self.maintenance.is_some())
            .finish()
    }
}

/// Use the configured host version when set, otherwise ask the host.
async fn resolve_adapter(
    config: &RuntimeConfig,
    host: Arc<dyn HostConnection>,
) -> NexusResult<(VersionAdapterRegistry, Arc<dyn HostAdapter>)> {
    let version = match config.nexus.bridge.host_version {
        Some(version) => {
            tracing::info!(version = %version, "host version taken from configuration");
            version
        }
        None => probe_host_version(host.as_ref()).await?,
    };

    let registry = VersionAdapterRegistry::from_config(&config.nexus.bridge);
    let adapter = registry.resolve(version, host).map_err(|e| {
        tracing::error!(version = %version, error = %e, "no usable host adapter");
        NexusError::from(e)
    })?;
    Ok((registry, adapter))
}

// =============================================================================
// TESTS
// =============================================================================
