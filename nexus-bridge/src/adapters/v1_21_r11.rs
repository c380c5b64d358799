//! Adapter for 1.21.11 and newer hosts.
//!
//! Behaves like 1.21.10 and adds the dedicated cursor item packet, so the
//! carried stack can be faked without touching container slots.

use async_trait::async_trait;
use nexus_core::{BridgeResult, HostVersionTag};
use serde::Serialize;
use std::sync::Arc;

use super::packets::{ComponentItem, SET_CURSOR_ITEM};
use super::v1_21_r10::{self, V1_21R10};
use crate::contract::{
    check_item, BlockPos, Capabilities, Capability, Dialog, HostAdapter, ItemView, PlayerId,
};
use crate::host::HostConnection;

pub const ADAPTER_ID: &str = "v1_21_r11";

/// `item: None` asks the host to resend the real carried stack.
#[derive(Debug, Clone, Serialize)]
struct SetCursorItemPacket {
    item: Option<ComponentItem>,
}

#[derive(Debug)]
pub struct V1_21R11 {
    base: V1_21R10,
}

impl V1_21R11 {
    pub fn new(version: HostVersionTag, host: Arc<dyn HostConnection>) -> BridgeResult<Self> {
        let mut channels = v1_21_r10::REQUIRED_CHANNELS.to_vec();
        channels.push(SET_CURSOR_ITEM);
        Ok(Self {
            base: V1_21R10::with_id(ADAPTER_ID, &channels, version, host)?,
        })
    }

    pub fn has_packet_rewriter(&self, player: PlayerId) -> bool {
        self.base.has_packet_rewriter(player)
    }
}

#[async_trait]
impl HostAdapter for V1_21R11 {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn version(&self) -> HostVersionTag {
        self.base.version()
    }

    fn capabilities(&self) -> Capabilities {
        self.base.capabilities().with(Capability::CursorItem)
    }

    async fn send_message(&self, player: PlayerId, text: &str) -> BridgeResult<()> {
        self.base.send_message(player, text).await
    }

    async fn send_fake_item(
        &self,
        player: PlayerId,
        slot: i32,
        item: &ItemView,
        name: Option<&str>,
        lore: Option<&[String]>,
    ) -> BridgeResult<()> {
        self.base
            .send_fake_item(player, slot, item, name, lore)
            .await
    }

    async fn reset_item_view(&self, player: PlayerId, slot: i32) -> BridgeResult<()> {
        self.base.reset_item_view(player, slot).await
    }

    async fn install_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        self.base.install_packet_rewriter(player).await
    }

    async fn uninstall_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        self.base.uninstall_packet_rewriter(player).await
    }

    async fn send_block_break_stage(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        stage: i8,
    ) -> BridgeResult<()> {
        self.base.send_block_break_stage(player, pos, stage).await
    }

    async fn send_fake_block_change(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        block_state: &str,
    ) -> BridgeResult<()> {
        self.base
            .send_fake_block_change(player, pos, block_state)
            .await
    }

    async fn send_reset_block(&self, player: PlayerId, pos: &BlockPos) -> BridgeResult<()> {
        self.base.send_reset_block(player, pos).await
    }

    async fn open_dialog(&self, player: PlayerId, dialog: &Dialog) -> BridgeResult<()> {
        self.base.open_dialog(player, dialog).await
    }

    async fn send_fake_cursor_item(
        &self,
        player: PlayerId,
        item: &ItemView,
        name: Option<&str>,
        lore: Option<&[String]>,
    ) -> BridgeResult<()> {
        check_item("send_fake_cursor_item", item)?;
        let packet = SetCursorItemPacket {
            item: Some(ComponentItem::from(&item.overridden(name, lore))),
        };
        self.base
            .core()
            .send("send_fake_cursor_item", player, SET_CURSOR_ITEM, &packet)
            .await
    }

    async fn reset_cursor_item(&self, player: PlayerId) -> BridgeResult<()> {
        self.base
            .core()
            .send(
                "reset_cursor_item",
                player,
                SET_CURSOR_ITEM,
                &SetCursorItemPacket { item: None },
            )
            .await
    }
}
