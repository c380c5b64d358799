//! NEXUS Test Utilities
//!
//! Shared test infrastructure for the NEXUS workspace:
//! - A recording fake host for driving adapters without a server
//! - Proptest generators for keys, payloads, versions and items
//! - Fixtures wiring in-memory stores, caches and sync nodes
//! - Assertions for the outcomes callers branch on

pub use nexus_bridge::{HostCall, HostConnection, HostFault, ItemView, PlayerId};
pub use nexus_core::{
    BridgeError, BridgeResult, HostVersionTag, NexusConfig, Revision, SharedCacheConfig,
    StateKey, StateRecord, StorageError, StorageResult, SyncConfig, VersionPattern, WriteOutcome,
};
pub use nexus_storage::{InMemorySharedCache, InMemoryStateStore, StateSyncService};

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Sync node over the in-memory store and cache.
pub type MemoryNode = StateSyncService<InMemoryStateStore, InMemorySharedCache>;

// ============================================================================
// RECORDING HOST
// ============================================================================

#[derive(Debug, Default)]
struct HostState {
    version: String,
    missing: HashSet<String>,
    failing: HashSet<String>,
    probe_fault: Option<String>,
    calls: Vec<(PlayerId, HostCall)>,
}

/// Fake host that records every dispatched packet.
///
/// Supports every channel unless told otherwise, and answers the version
/// probe with whatever string it was built with.
#[derive(Debug)]
pub struct RecordingHost {
    state: Mutex<HostState>,
}

impl RecordingHost {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HostState {
                version: version.into(),
                ..HostState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report `channel` as absent, so adapters needing it fail to build.
    pub fn without_channel(self, channel: &str) -> Self {
        self.state().missing.insert(channel.to_string());
        self
    }

    /// Make every dispatch on `channel` fail.
    pub fn fail_channel(&self, channel: &str) {
        self.state().failing.insert(channel.to_string());
    }

    pub fn heal_channel(&self, channel: &str) {
        self.state().failing.remove(channel);
    }

    /// Make the version probe fail with `reason`.
    pub fn fail_probe(&self, reason: &str) {
        self.state().probe_fault = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn calls_on(&self, channel: &str) -> Vec<HostCall> {
        self.state()
            .calls
            .iter()
            .filter(|(_, call)| call.channel == channel)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn calls_for(&self, player: PlayerId) -> Vec<HostCall> {
        self.state()
            .calls
            .iter()
            .filter(|(to, _)| *to == player)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn channels(&self) -> Vec<&'static str> {
        self.state().calls.iter().map(|(_, call)| call.channel).collect()
    }

    pub fn clear(&self) {
        self.state().calls.clear();
    }
}

#[async_trait]
impl HostConnection for RecordingHost {
    async fn probe_version(&self) -> Result<String, HostFault> {
        let state = self.state();
        match &state.probe_fault {
            Some(reason) => Err(HostFault::new(reason.clone())),
            None => Ok(state.version.clone()),
        }
    }

    fn supports_channel(&self, channel: &str) -> bool {
        !self.state().missing.contains(channel)
    }

    async fn dispatch(&self, player: PlayerId, call: HostCall) -> Result<(), HostFault> {
        let mut state = self.state();
        if state.failing.contains(call.channel) {
            return Err(HostFault::new(format!("{} unavailable", call.channel)));
        }
        state.calls.push((player, call));
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for NEXUS types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Namespace accepted by [`StateKey::new`].
    pub fn arb_namespace() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.-]{0,23}"
    }

    pub fn arb_state_key() -> impl Strategy<Value = StateKey> {
        (arb_uuid(), arb_namespace()).prop_map(|(id, ns)| {
            StateKey::new(id, ns).unwrap_or_else(|e| panic!("generated namespace rejected: {}", e))
        })
    }

    pub fn arb_revision() -> impl Strategy<Value = Revision> {
        (0i64..10_000).prop_map(Revision::new)
    }

    /// Small JSON documents of the kind feature modules store.
    pub fn arb_payload() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(|n| json!({ "value": n })),
            "[a-zA-Z0-9 ]{0,32}".prop_map(|s| json!({ "label": s })),
            (any::<bool>(), 0u32..100).prop_map(|(flag, level)| json!({
                "enabled": flag,
                "level": level,
            })),
            prop::collection::vec(0u16..1000, 0..8).prop_map(|items| json!({ "items": items })),
        ]
    }

    pub fn arb_host_version_tag() -> impl Strategy<Value = HostVersionTag> {
        (1u32..3, 0u32..30, 0u32..20)
            .prop_map(|(major, minor, patch)| HostVersionTag::new(major, minor, patch))
    }

    pub fn arb_version_pattern() -> impl Strategy<Value = VersionPattern> {
        prop_oneof![
            arb_host_version_tag().prop_map(VersionPattern::Exact),
            (1u32..3, 0u32..30).prop_map(|(major, minor)| VersionPattern::Minor { major, minor }),
            (arb_host_version_tag(), arb_host_version_tag(), any::<bool>()).prop_filter_map(
                "empty range",
                |(a, b, inclusive)| {
                    let (min, max) = if a <= b { (a, b) } else { (b, a) };
                    if !inclusive && min == max {
                        return None;
                    }
                    Some(VersionPattern::Range {
                        min,
                        max,
                        inclusive,
                    })
                }
            ),
            arb_host_version_tag().prop_map(VersionPattern::AtLeast),
        ]
    }

    pub fn arb_item_view() -> impl Strategy<Value = ItemView> {
        (
            "minecraft:[a-z_]{1,16}",
            1u8..=64,
            proptest::option::of("[A-Za-z ]{1,16}"),
            prop::collection::vec("[A-Za-z ]{0,24}", 0..4),
        )
            .prop_map(|(material, amount, name, lore)| {
                let mut item = ItemView::new(material, amount).with_lore(lore);
                item.display_name = name;
                item
            })
    }

    /// Player inventory slot, always valid.
    pub fn arb_slot() -> impl Strategy<Value = i32> {
        0i32..=40
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired stores, caches and nodes.

    use super::*;
    use std::time::Duration;

    pub fn state_key(namespace: &str) -> StateKey {
        StateKey::new(Uuid::new_v4(), namespace)
            .unwrap_or_else(|e| panic!("fixture namespace rejected: {}", e))
    }

    pub fn player() -> PlayerId {
        Uuid::new_v4()
    }

    /// Cache settings that retry quickly after a failure.
    pub fn fast_cache_config() -> SharedCacheConfig {
        SharedCacheConfig {
            reconnect_backoff_ms: 10,
            ..SharedCacheConfig::default()
        }
    }

    pub fn memory_store(pool_size: usize, wait: Duration) -> Arc<InMemoryStateStore> {
        Arc::new(
            InMemoryStateStore::new(pool_size, wait)
                .unwrap_or_else(|e| panic!("memory store: {}", e)),
        )
    }

    pub fn memory_cache() -> Arc<InMemorySharedCache> {
        Arc::new(InMemorySharedCache::new())
    }

    /// A node named `node_id` sharing `store` and `cache` with its peers.
    pub fn memory_node(
        store: &Arc<InMemoryStateStore>,
        cache: &Arc<InMemorySharedCache>,
        node_id: &str,
    ) -> Arc<MemoryNode> {
        Arc::new(StateSyncService::new(
            Arc::clone(store),
            Some(Arc::clone(cache)),
            SyncConfig::default().with_node_id(node_id),
            &fast_cache_config(),
        ))
    }

    /// Configuration for in-process runtime tests.
    pub fn test_config(node_id: &str) -> NexusConfig {
        let mut config = NexusConfig::default();
        config.store.pool_size = 4;
        config.store.wait_timeout_ms = 500;
        config.cache = fast_cache_config();
        config.sync = SyncConfig::default().with_node_id(node_id);
        config
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for the results callers branch on.

    use super::*;

    #[track_caller]
    pub fn assert_applied(outcome: &WriteOutcome) -> &StateRecord {
        match outcome {
            WriteOutcome::Applied(record) => record,
            other => panic!("Expected Applied, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_conflict(outcome: &WriteOutcome) {
        assert!(
            matches!(outcome, WriteOutcome::RevisionConflict { .. }),
            "Expected RevisionConflict, got: {:?}",
            outcome
        );
    }

    #[track_caller]
    pub fn assert_pool_exhausted<T: std::fmt::Debug>(result: &StorageResult<T>) {
        match result {
            Err(StorageError::PoolExhausted { .. }) => {}
            other => panic!("Expected PoolExhausted, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_unsupported_version<T: std::fmt::Debug>(result: &BridgeResult<T>) {
        match result {
            Err(BridgeError::UnsupportedHostVersion { .. }) => {}
            other => panic!("Expected UnsupportedHostVersion, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_ambiguous_version<T: std::fmt::Debug>(result: &BridgeResult<T>) {
        match result {
            Err(BridgeError::AmbiguousHostVersion { .. }) => {}
            other => panic!("Expected AmbiguousHostVersion, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_host_failure<T: std::fmt::Debug>(result: &BridgeResult<T>, operation: &str) {
        match result {
            Err(BridgeError::HostOperationFailed { operation: op, .. }) => {
                assert_eq!(op, operation, "Wrong operation in HostOperationFailed");
            }
            other => panic!("Expected HostOperationFailed for {}, got: {:?}", operation, other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
