//! Transport between adapters and the running host.
//!
//! A [`HostConnection`] is the only thing an adapter talks to. It answers the
//! startup version probe, reports which packet channels the host exposes, and
//! delivers encoded packets to one player. Adapters own the packet shapes;
//! the connection never interprets a payload.

use async_trait::async_trait;
use nexus_core::{BridgeError, BridgeResult, HostVersionTag};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::contract::PlayerId;

/// Failure reported by the host for a single call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct HostFault {
    pub reason: String,
}

impl HostFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One encoded packet addressed to a named host channel.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCall {
    pub channel: &'static str,
    pub payload: Value,
}

impl HostCall {
    /// Encode `packet` for `channel`.
    pub fn encode<T: Serialize>(
        operation: &str,
        channel: &'static str,
        packet: &T,
    ) -> BridgeResult<Self> {
        let payload =
            serde_json::to_value(packet).map_err(|e| BridgeError::HostOperationFailed {
                operation: operation.to_string(),
                cause: format!("packet encoding failed: {}", e),
            })?;
        Ok(Self { channel, payload })
    }
}

/// Low-level access to the host process.
#[async_trait]
pub trait HostConnection: Send + Sync {
    /// Raw release string as the host reports it, e.g. `1.21.10-R0.1-SNAPSHOT`.
    async fn probe_version(&self) -> Result<String, HostFault>;

    /// Whether the host exposes `channel`. Checked once at adapter construction.
    fn supports_channel(&self, channel: &str) -> bool;

    /// Deliver `call` to `player`'s client.
    async fn dispatch(&self, player: PlayerId, call: HostCall) -> Result<(), HostFault>;
}

/// Run the startup probe and parse its answer.
pub async fn probe_host_version(host: &dyn HostConnection) -> BridgeResult<HostVersionTag> {
    let raw = host
        .probe_version()
        .await
        .map_err(|fault| BridgeError::ProbeFailed {
            reason: fault.reason,
        })?;
    let tag = raw.parse().map_err(|e| BridgeError::ProbeFailed {
        reason: format!("{}", e),
    })?;
    tracing::info!(raw = %raw, version = %tag, "host version detected");
    Ok(tag)
}

/// Encode and deliver one packet, mapping host faults to `HostOperationFailed`.
pub(crate) async fn send_packet<T: Serialize + Sync>(
    host: &dyn HostConnection,
    operation: &str,
    player: PlayerId,
    channel: &'static str,
    packet: &T,
) -> BridgeResult<()> {
    let call = HostCall::encode(operation, channel, packet)?;
    host.dispatch(player, call)
        .await
        .map_err(|fault| BridgeError::HostOperationFailed {
            operation: operation.to_string(),
            cause: fault.reason,
        })
}

/// Fail adapter construction if the host lacks any of `channels`.
pub(crate) fn require_channels(
    adapter: &str,
    host: &dyn HostConnection,
    channels: &[&str],
) -> BridgeResult<()> {
    let missing: Vec<&str> = channels
        .iter()
        .copied()
        .filter(|channel| !host.supports_channel(channel))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(BridgeError::AdapterInitFailed {
        adapter: adapter.to_string(),
        reason: format!("host is missing channels: {}", missing.join(", ")),
    })
}

// =============================================================================
// TESTS
// =============================================================================
