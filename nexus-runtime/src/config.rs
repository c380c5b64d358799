//! Runtime configuration loading.
//!
//! A config file is the shared [`NexusConfig`] tables plus `[telemetry]` and
//! `[maintenance]`:
//!
//! ```toml
//! [store]
//! host = "db.internal"
//! pool_size = 8
//!
//! [cache]
//! url = "redis://cache.internal:6379"
//!
//! [sync]
//! node_id = "survival-1"
//!
//! [[bridge.bindings]]
//! pattern = "1.21.10"
//! adapter = "v1_21_r10"
//!
//! [telemetry]
//! json = true
//!
//! [maintenance]
//! tombstone_retention_secs = 86400
//! ```

use nexus_core::{ConfigError, NexusConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::maintenance::MaintenanceConfig;
use crate::telemetry::TelemetryConfig;

/// Environment variable naming a config file.
pub const CONFIG_PATH_ENV: &str = "NEXUS_CONFIG";

/// Everything a NEXUS process needs to start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(flatten)]
    pub nexus: NexusConfig,
    pub telemetry: TelemetryConfig,
    pub maintenance: MaintenanceConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults overridden by `NEXUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            nexus: NexusConfig::from_env()?,
            telemetry: TelemetryConfig::from_env(),
            maintenance: MaintenanceConfig::from_env()?,
        })
    }

    /// Load from `path`, else the file named by `NEXUS_CONFIG`, else the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim())),
            _ => Self::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.nexus.validate()?;
        self.maintenance.validate()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_core::HostVersionTag;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [store]
        host = "db.internal"
        pool_size = 2

        [sync]
        node_id = "lobby-2"

        [bridge]
        host_version = "1.21.11"

        [telemetry]
        json = true

        [maintenance]
        cache_check_interval_secs = 5
    "#;

    #[test]
    fn test_sections_parse_together() {
        let config = RuntimeConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.nexus.store.host, "db.internal");
        assert_eq!(config.nexus.sync.node_id, "lobby-2");
        assert_eq!(
            config.nexus.bridge.host_version,
            Some(HostVersionTag::new(1, 21, 11))
        );
        assert!(config.telemetry.json);
        assert_eq!(config.maintenance.cache_check_interval_secs, 5);
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        let defaults = RuntimeConfig::default();
        assert_eq!(config.nexus.store, defaults.nexus.store);
        assert_eq!(config.nexus.cache, defaults.nexus.cache);
        assert_eq!(config.telemetry, defaults.telemetry);
        assert_eq!(config.maintenance, defaults.maintenance);
        // node ids are generated per default instance
        assert!(config.nexus.sync.node_id.starts_with("node-"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = RuntimeConfig::from_toml_str("[store]\npool_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = RuntimeConfig::from_toml_str("[maintenance]\ncache_check_interval_secs = 0")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = RuntimeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.nexus.store.pool_size, 2);
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let err = RuntimeConfig::from_file(Path::new("/nonexistent/nexus.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
