//! Host version to adapter resolution.
//!
//! The registry holds adapter factories keyed by id and a binding table
//! mapping [`VersionPattern`]s to ids. [`VersionAdapterRegistry::resolve`]
//! runs once per process: the first successful call builds the adapter and
//! every later call returns that same instance.
//!
//! Resolution never builds more than one adapter. A tag that matches two
//! bindings fails before any factory runs.

use nexus_core::{BindingConfig, BridgeConfig, BridgeError, BridgeResult, HostVersionTag};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapters::{builtin_factories, default_bindings};
use crate::contract::HostAdapter;
use crate::host::HostConnection;

/// Builds an adapter for a resolved version. Must fail fast if the host is
/// missing anything the adapter needs.
pub type AdapterFactory = Arc<
    dyn Fn(HostVersionTag, Arc<dyn HostConnection>) -> BridgeResult<Arc<dyn HostAdapter>>
        + Send
        + Sync,
>;

struct ActiveAdapter {
    version: HostVersionTag,
    adapter: Arc<dyn HostAdapter>,
}

/// Adapter factories plus the binding table that selects among them.
pub struct VersionAdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
    bindings: Vec<BindingConfig>,
    active: OnceCell<ActiveAdapter>,
}

impl VersionAdapterRegistry {
    /// Empty registry: no factories, no bindings.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            bindings: Vec::new(),
            active: OnceCell::new(),
        }
    }

    /// Every compiled-in adapter with the shipped binding table.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        for (id, factory) in builtin_factories() {
            registry.register_factory(id, factory);
        }
        for binding in default_bindings() {
            registry.bind(binding);
        }
        registry
    }

    /// Built-in factories with the configured bindings, or the shipped table
    /// when the configuration has none.
    pub fn from_config(config: &BridgeConfig) -> Self {
        if config.bindings.is_empty() {
            return Self::with_builtin_adapters();
        }
        let mut registry = Self::new();
        for (id, factory) in builtin_factories() {
            registry.register_factory(id, factory);
        }
        for binding in &config.bindings {
            registry.bind(binding.clone());
        }
        registry
    }

    /// Register or replace the factory for `id`.
    pub fn register_factory(&mut self, id: impl Into<String>, factory: AdapterFactory) {
        self.factories.insert(id.into(), factory);
    }

    /// Add a binding. Overlaps are allowed here but make any tag in the
    /// intersection unresolvable, so they are logged.
    pub fn bind(&mut self, binding: BindingConfig) {
        for existing in &self.bindings {
            if existing.pattern.overlaps(&binding.pattern) {
                tracing::warn!(
                    pattern = %binding.pattern,
                    adapter = %binding.adapter,
                    overlaps = %existing.pattern,
                    other_adapter = %existing.adapter,
                    "overlapping adapter bindings"
                );
            }
        }
        self.bindings.push(binding);
    }

    pub fn bindings(&self) -> &[BindingConfig] {
        &self.bindings
    }

    pub fn has_factory(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Bindings whose pattern matches `version`.
    pub fn matching(&self, version: &HostVersionTag) -> Vec<&BindingConfig> {
        self.bindings
            .iter()
            .filter(|binding| binding.pattern.matches(version))
            .collect()
    }

    /// Pairs of adapter ids whose bindings overlap.
    pub fn overlapping_bindings(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (i, a) in self.bindings.iter().enumerate() {
            for b in self.bindings.iter().skip(i + 1) {
                if a.pattern.overlaps(&b.pattern) {
                    pairs.push((a.adapter.clone(), b.adapter.clone()));
                }
            }
        }
        pairs
    }

    /// Select and build the adapter for `version`, or return the one already
    /// built for it.
    ///
    /// # Errors
    /// - `UnsupportedHostVersion` when no binding matches
    /// - `AmbiguousHostVersion` when more than one does
    /// - `UnknownAdapter` when the binding names no registered factory
    /// - `AlreadyResolved` when an adapter was built for another version
    /// - whatever the factory reports
    pub fn resolve(
        &self,
        version: HostVersionTag,
        host: Arc<dyn HostConnection>,
    ) -> BridgeResult<Arc<dyn HostAdapter>> {
        let active = self
            .active
            .get_or_try_init(|| self.instantiate(version, host))?;
        if active.version != version {
            return Err(BridgeError::AlreadyResolved {
                active: active.version,
                requested: version,
            });
        }
        Ok(Arc::clone(&active.adapter))
    }

    /// The adapter built by [`Self::resolve`].
    pub fn active(&self) -> BridgeResult<Arc<dyn HostAdapter>> {
        self.active
            .get()
            .map(|active| Arc::clone(&active.adapter))
            .ok_or(BridgeError::NotResolved)
    }

    pub fn active_version(&self) -> Option<HostVersionTag> {
        self.active.get().map(|active| active.version)
    }

    fn instantiate(
        &self,
        version: HostVersionTag,
        host: Arc<dyn HostConnection>,
    ) -> BridgeResult<ActiveAdapter> {
        let matches = self.matching(&version);
        let binding = match matches.as_slice() {
            [] => return Err(BridgeError::UnsupportedHostVersion { version }),
            [only] => *only,
            many => {
                return Err(BridgeError::AmbiguousHostVersion {
                    version,
                    adapters: many.iter().map(|b| b.adapter.clone()).collect(),
                })
            }
        };

        let factory = self
            .factories
            .get(&binding.adapter)
            .ok_or_else(|| BridgeError::UnknownAdapter {
                adapter: binding.adapter.clone(),
            })?;

        let adapter = factory(version, host).map_err(|e| {
            tracing::error!(
                adapter = %binding.adapter,
                version = %version,
                error = %e,
                "adapter construction failed"
            );
            e
        })?;
        tracing::info!(
            adapter = adapter.id(),
            version = %version,
            pattern = %binding.pattern,
            capabilities = %adapter.capabilities(),
            "host adapter resolved"
        );
        Ok(ActiveAdapter { version, adapter })
    }
}

impl Default for VersionAdapterRegistry {
    fn default() -> Self {
        Self::with_builtin_adapters()
    }
}

impl fmt::Debug for VersionAdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut factories: Vec<&String> = self.factories.keys().collect();
        factories.sort();
        f.debug_struct("VersionAdapterRegistry")
            .field("factories", &factories)
            .field("bindings", &self.bindings.len())
            .field("active", &self.active_version())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
