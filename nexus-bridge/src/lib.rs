//! NEXUS Bridge - Version-Stable Host Access
//!
//! Feature code talks to the host through [`HostAdapter`] only. At startup
//! the host version is probed once, [`VersionAdapterRegistry`] picks the
//! adapter bound to that version, and the same adapter serves the process
//! until shutdown.
//!
//! ```ignore
//! let version = probe_host_version(host.as_ref()).await?;
//! let registry = VersionAdapterRegistry::from_config(&config.bridge);
//! let adapter = registry.resolve(version, host)?;
//! adapter.send_message(player, "welcome back").await?;
//! ```

pub mod adapters;
pub mod contract;
pub mod host;
pub mod registry;

pub use contract::{
    BlockPos, Capabilities, Capability, Dialog, DialogButton, HostAdapter, ItemView, PlayerId,
};
pub use host::{probe_host_version, HostCall, HostConnection, HostFault};
pub use registry::{AdapterFactory, VersionAdapterRegistry};
