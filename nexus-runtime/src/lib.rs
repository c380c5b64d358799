//! NEXUS Runtime - Process Lifecycle
//!
//! Embedding code hands the runtime a [`HostConnection`](nexus_bridge::HostConnection)
//! and a [`RuntimeConfig`]; the runtime resolves the host adapter, opens the
//! store, connects the shared cache and keeps the background tasks running
//! until [`NexusRuntime::shutdown`].
//!
//! ```ignore
//! let config = RuntimeConfig::load(None)?;
//! init_tracing(&config.telemetry);
//! let runtime = ProductionRuntime::start(config, host).await?;
//! let adapter = runtime.adapter();
//! let sync = runtime.sync();
//! // ...
//! runtime.shutdown().await;
//! ```

pub mod config;
pub mod maintenance;
pub mod runtime;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use maintenance::{MaintenanceConfig, MaintenanceSnapshot};
pub use runtime::{NexusRuntime, ProductionRuntime, RuntimeHealth};
pub use telemetry::{init_tracing, TelemetryConfig};
