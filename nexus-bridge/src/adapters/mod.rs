//! Concrete adapters, one per supported host release.
//!
//! Every adapter is a plain struct built by a factory registered under its
//! id. Which host versions select which adapter is decided by bindings in
//! configuration; [`default_bindings`] is what ships.

pub mod packets;
pub mod v1_21_r10;
pub mod v1_21_r11;
pub mod v1_21_r7;
pub mod v1_21_r8;

pub use v1_21_r10::V1_21R10;
pub use v1_21_r11::V1_21R11;
pub use v1_21_r7::V1_21R7;
pub use v1_21_r8::V1_21R8;

use dashmap::DashSet;
use nexus_core::{BindingConfig, BridgeResult, HostVersionTag, VersionPattern};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::contract::{check_slot, menu_slot, HostAdapter, PlayerId};
use crate::host::{send_packet, HostConnection};
use crate::registry::AdapterFactory;
use packets::{
    PipelineAction, PipelinePacket, ResyncSlotPacket, SystemChatPacket, PIPELINE,
    PLAYER_CONTAINER, RESYNC_SLOT, REWRITER_HANDLER, SYSTEM_CHAT,
};

/// Factories for every adapter compiled into this build, keyed by id.
pub fn builtin_factories() -> Vec<(&'static str, AdapterFactory)> {
    fn factory<A, F>(build: F) -> AdapterFactory
    where
        A: HostAdapter + 'static,
        F: Fn(HostVersionTag, Arc<dyn HostConnection>) -> BridgeResult<A> + Send + Sync + 'static,
    {
        Arc::new(move |version, host| {
            let adapter: Arc<dyn HostAdapter> = Arc::new(build(version, host)?);
            Ok(adapter)
        })
    }

    vec![
        (v1_21_r7::ADAPTER_ID, factory(V1_21R7::new)),
        (v1_21_r8::ADAPTER_ID, factory(V1_21R8::new)),
        (v1_21_r10::ADAPTER_ID, factory(V1_21R10::new)),
        (v1_21_r11::ADAPTER_ID, factory(V1_21R11::new)),
    ]
}

/// Shipped binding table. Patterns are mutually exclusive.
pub fn default_bindings() -> Vec<BindingConfig> {
    let bind = |min: HostVersionTag, max: Option<HostVersionTag>, adapter: &str| BindingConfig {
        pattern: match max {
            Some(max) if max == min => VersionPattern::Exact(min),
            Some(max) => VersionPattern::Range {
                min,
                max,
                inclusive: true,
            },
            None => VersionPattern::AtLeast(min),
        },
        adapter: adapter.to_string(),
    };
    let v = HostVersionTag::new;

    vec![
        bind(v(1, 21, 7), Some(v(1, 21, 7)), v1_21_r7::ADAPTER_ID),
        bind(v(1, 21, 8), Some(v(1, 21, 9)), v1_21_r8::ADAPTER_ID),
        bind(v(1, 21, 10), Some(v(1, 21, 10)), v1_21_r10::ADAPTER_ID),
        bind(v(1, 21, 11), None, v1_21_r11::ADAPTER_ID),
    ]
}

// ============================================================================
// SHARED ADAPTER STATE
// ============================================================================

/// Host handle, resolved version and per-player rewriter bookkeeping.
pub(crate) struct AdapterCore {
    id: &'static str,
    host: Arc<dyn HostConnection>,
    version: HostVersionTag,
    rewriters: DashSet<PlayerId>,
}

impl AdapterCore {
    pub(crate) fn new(
        id: &'static str,
        host: Arc<dyn HostConnection>,
        version: HostVersionTag,
    ) -> Self {
        tracing::info!(adapter = id, version = %version, "host adapter initialized");
        Self {
            id,
            host,
            version,
            rewriters: DashSet::new(),
        }
    }

    pub(crate) fn version(&self) -> HostVersionTag {
        self.version
    }

    pub(crate) fn host(&self) -> &dyn HostConnection {
        self.host.as_ref()
    }

    pub(crate) async fn send<T: Serialize + Sync>(
        &self,
        operation: &str,
        player: PlayerId,
        channel: &'static str,
        packet: &T,
    ) -> BridgeResult<()> {
        send_packet(self.host(), operation, player, channel, packet).await
    }

    pub(crate) async fn chat(&self, player: PlayerId, text: &str) -> BridgeResult<()> {
        self.send("send_message", player, SYSTEM_CHAT, &SystemChatPacket::chat(text))
            .await
    }

    pub(crate) async fn resync_slot(&self, player: PlayerId, slot: i32) -> BridgeResult<()> {
        check_slot("reset_item_view", slot)?;
        let packet = ResyncSlotPacket {
            container_id: PLAYER_CONTAINER,
            slot: menu_slot(slot),
        };
        self.send("reset_item_view", player, RESYNC_SLOT, &packet)
            .await
    }

    pub(crate) fn has_rewriter(&self, player: PlayerId) -> bool {
        self.rewriters.contains(&player)
    }

    pub(crate) async fn install_rewriter(
        &self,
        player: PlayerId,
        before: Option<&'static str>,
    ) -> BridgeResult<()> {
        if !self.rewriters.insert(player) {
            return Ok(());
        }
        let packet = PipelinePacket {
            action: PipelineAction::Install,
            handler: REWRITER_HANDLER,
            before,
        };
        let sent = self
            .send("install_packet_rewriter", player, PIPELINE, &packet)
            .await;
        if sent.is_err() {
            self.rewriters.remove(&player);
        } else {
            tracing::debug!(adapter = self.id, player = %player, "packet rewriter installed");
        }
        sent
    }

    pub(crate) async fn uninstall_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        if self.rewriters.remove(&player).is_none() {
            return Ok(());
        }
        let packet = PipelinePacket {
            action: PipelineAction::Uninstall,
            handler: REWRITER_HANDLER,
            before: None,
        };
        self.send("uninstall_packet_rewriter", player, PIPELINE, &packet)
            .await
    }
}

impl fmt::Debug for AdapterCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterCore")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("rewriters", &self.rewriters.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bindings_are_exclusive() {
        let bindings = default_bindings();
        for (i, a) in bindings.iter().enumerate() {
            for b in bindings.iter().skip(i + 1) {
                assert!(
                    !a.pattern.overlaps(&b.pattern),
                    "{} overlaps {}",
                    a.pattern,
                    b.pattern
                );
            }
        }
    }

    #[test]
    fn test_every_default_binding_has_a_factory() {
        let ids: Vec<&str> = builtin_factories().into_iter().map(|(id, _)| id).collect();
        for binding in default_bindings() {
            assert!(ids.contains(&binding.adapter.as_str()), "{}", binding.adapter);
        }
    }

    #[test]
    fn test_default_binding_for_each_release() {
        let bindings = default_bindings();
        let adapter_for = |patch: u32| {
            let tag = HostVersionTag::new(1, 21, patch);
            bindings
                .iter()
                .filter(|b| b.pattern.matches(&tag))
                .map(|b| b.adapter.clone())
                .collect::<Vec<_>>()
        };
        assert!(adapter_for(6).is_empty());
        assert_eq!(adapter_for(7), vec!["v1_21_r7"]);
        assert_eq!(adapter_for(9), vec!["v1_21_r8"]);
        assert_eq!(adapter_for(10), vec!["v1_21_r10"]);
        assert_eq!(adapter_for(14), vec!["v1_21_r11"]);
    }
}
