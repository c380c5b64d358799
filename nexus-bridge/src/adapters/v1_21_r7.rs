//! Adapter for 1.21.7 hosts.
//!
//! The oldest supported release. Items still travel with the legacy display
//! tag, and the host exposes no hook into the player's network pipeline, so
//! the packet rewriter calls are accepted and ignored.

use async_trait::async_trait;
use nexus_core::{BridgeResult, HostVersionTag};
use serde::Serialize;
use std::sync::Arc;

use super::packets::{
    SetSlotPacket, TextComponent, PLAYER_CONTAINER, RESYNC_SLOT, SET_SLOT, SYSTEM_CHAT,
};
use super::AdapterCore;
use crate::contract::{
    check_item, check_slot, menu_slot, Capabilities, HostAdapter, ItemView, PlayerId,
};
use crate::host::{require_channels, HostConnection};

pub const ADAPTER_ID: &str = "v1_21_r7";

const REQUIRED_CHANNELS: &[&str] = &[SYSTEM_CHAT, SET_SLOT, RESYNC_SLOT];

/// Item with the pre-component `tag.display` block. Name and lore entries
/// are serialized text components.
#[derive(Debug, Clone, Serialize)]
struct LegacyItem {
    id: String,
    #[serde(rename = "Count")]
    count: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<LegacyTag>,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyTag {
    display: LegacyDisplay,
}

#[derive(Debug, Clone, Serialize)]
struct LegacyDisplay {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "Lore", skip_serializing_if = "Vec::is_empty")]
    lore: Vec<String>,
}

fn text_json(text: &str) -> String {
    serde_json::to_string(&TextComponent::upright(text))
        .unwrap_or_else(|_| format!("{:?}", text))
}

impl From<&ItemView> for LegacyItem {
    fn from(item: &ItemView) -> Self {
        let tag = if item.display_name.is_none() && item.lore.is_empty() {
            None
        } else {
            Some(LegacyTag {
                display: LegacyDisplay {
                    name: item.display_name.as_deref().map(text_json),
                    lore: item.lore.iter().map(|line| text_json(line)).collect(),
                },
            })
        };
        Self {
            id: item.material.clone(),
            count: item.amount,
            tag,
        }
    }
}

#[derive(Debug)]
pub struct V1_21R7 {
    core: AdapterCore,
}

impl V1_21R7 {
    pub fn new(version: HostVersionTag, host: Arc<dyn HostConnection>) -> BridgeResult<Self> {
        require_channels(ADAPTER_ID, host.as_ref(), REQUIRED_CHANNELS)?;
        Ok(Self {
            core: AdapterCore::new(ADAPTER_ID, host, version),
        })
    }
}

#[async_trait]
impl HostAdapter for V1_21R7 {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn version(&self) -> HostVersionTag {
        self.core.version()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn send_message(&self, player: PlayerId, text: &str) -> BridgeResult<()> {
        self.core.chat(player, text).await
    }

    async fn send_fake_item(
        &self,
        player: PlayerId,
        slot: i32,
        item: &ItemView,
        name: Option<&str>,
        lore: Option<&[String]>,
    ) -> BridgeResult<()> {
        check_slot("send_fake_item", slot)?;
        check_item("send_fake_item", item)?;
        let packet = SetSlotPacket {
            container_id: PLAYER_CONTAINER,
            slot: menu_slot(slot),
            item: LegacyItem::from(&item.overridden(name, lore)),
        };
        self.core
            .send("send_fake_item", player, SET_SLOT, &packet)
            .await
    }

    async fn reset_item_view(&self, player: PlayerId, slot: i32) -> BridgeResult<()> {
        self.core.resync_slot(player, slot).await
    }

    async fn install_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        tracing::debug!(adapter = ADAPTER_ID, player = %player, "packet rewriter not available, ignoring install");
        Ok(())
    }

    async fn uninstall_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        tracing::debug!(adapter = ADAPTER_ID, player = %player, "packet rewriter not available, ignoring uninstall");
        Ok(())
    }
}
