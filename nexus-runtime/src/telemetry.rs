//! Tracing subscriber setup.
//!
//! One global subscriber per process, filtered by `RUST_LOG` when set and by
//! [`TelemetryConfig::filter`] otherwise. The host usually owns stdout, so the
//! JSON formatter is available for log shippers.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "nexus=info";

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives, e.g. `nexus=debug,nexus_storage=trace`
    pub filter: String,
    /// Emit one JSON object per event instead of the human format
    pub json: bool,
    /// Include span target (module path) in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Defaults overridden by `NEXUS_LOG` and `NEXUS_LOG_JSON`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(filter) = std::env::var("NEXUS_LOG").ok().filter(|s| !s.trim().is_empty()) {
            config.filter = filter;
        }
        if let Ok(json) = std::env::var("NEXUS_LOG_JSON") {
            config.json = json == "true" || json == "1";
        }
        config
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber.
///
/// Returns `true` if this call installed it. Later calls, and calls made
/// after some other subscriber was set, are no-ops returning `false`.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let registry = tracing_subscriber::registry().with(config.env_filter());
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(config.with_target))
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::info!(filter = %config.filter, json = config.json, "Telemetry initialized");
            true
        }
        Err(_) => false,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter, "nexus=info");
        assert!(!config.json);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(&TelemetryConfig::default());
        assert!(!init_tracing(&TelemetryConfig::default()));
        assert!(!init_tracing(&TelemetryConfig {
            json: true,
            ..TelemetryConfig::default()
        }));
    }

    #[test]
    fn test_telemetry_from_toml() {
        let config: TelemetryConfig = toml::from_str("json = true").unwrap();
        assert!(config.json);
        assert_eq!(config.filter, DEFAULT_FILTER);
    }
}
