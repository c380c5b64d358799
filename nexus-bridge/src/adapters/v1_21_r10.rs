//! Adapter for 1.21.10 hosts.
//!
//! Same wire shapes as 1.21.8 for items and blocks. Dialogs gained the pause
//! and after-action fields, and the rewriter has to sit in front of the
//! vanilla `packet_handler` or bundled inventory packets skip it.

use async_trait::async_trait;
use nexus_core::{BridgeResult, HostVersionTag};
use serde::Serialize;
use std::sync::Arc;

use super::packets::{
    breaker_id, dialog_actions, dialog_body, dialog_kind, BlockDestructionPacket,
    BlockPosition, BlockResyncPacket, BlockUpdatePacket, ComponentItem, DialogAction,
    DialogBodyEntry, SetSlotPacket, TextComponent, BLOCK_DESTRUCTION, BLOCK_RESYNC,
    BLOCK_UPDATE, PIPELINE, PLAYER_CONTAINER, RESYNC_SLOT, SET_SLOT, SHOW_DIALOG, SYSTEM_CHAT,
};
use super::AdapterCore;
use crate::contract::{
    check_block_state, check_item, check_slot, check_stage, menu_slot, BlockPos, Capabilities,
    Capability, Dialog, HostAdapter, ItemView, PlayerId,
};
use crate::host::{require_channels, HostConnection};

pub const ADAPTER_ID: &str = "v1_21_r10";

pub(crate) const REQUIRED_CHANNELS: &[&str] = &[
    SYSTEM_CHAT,
    SET_SLOT,
    RESYNC_SLOT,
    PIPELINE,
    BLOCK_DESTRUCTION,
    BLOCK_UPDATE,
    BLOCK_RESYNC,
    SHOW_DIALOG,
];

/// Vanilla handler the rewriter is inserted before.
const PACKET_HANDLER: &str = "packet_handler";

#[derive(Debug, Clone, Serialize)]
struct ShowDialogPacket {
    #[serde(rename = "type")]
    kind: &'static str,
    title: TextComponent,
    body: Vec<DialogBodyEntry>,
    actions: Vec<DialogAction>,
    can_close_with_escape: bool,
    pause: bool,
    after_action: &'static str,
}

impl From<&Dialog> for ShowDialogPacket {
    fn from(dialog: &Dialog) -> Self {
        Self {
            kind: dialog_kind(dialog),
            title: TextComponent::plain(&dialog.title),
            body: dialog_body(dialog),
            actions: dialog_actions(dialog),
            can_close_with_escape: dialog.closable,
            pause: false,
            after_action: "close",
        }
    }
}

#[derive(Debug)]
pub struct V1_21R10 {
    core: AdapterCore,
}

impl V1_21R10 {
    pub fn new(version: HostVersionTag, host: Arc<dyn HostConnection>) -> BridgeResult<Self> {
        Self::with_id(ADAPTER_ID, REQUIRED_CHANNELS, version, host)
    }

    /// Build on top of this release's behavior under another adapter id.
    pub(crate) fn with_id(
        id: &'static str,
        channels: &[&str],
        version: HostVersionTag,
        host: Arc<dyn HostConnection>,
    ) -> BridgeResult<Self> {
        require_channels(id, host.as_ref(), channels)?;
        Ok(Self {
            core: AdapterCore::new(id, host, version),
        })
    }

    pub(crate) fn core(&self) -> &AdapterCore {
        &self.core
    }

    pub fn has_packet_rewriter(&self, player: PlayerId) -> bool {
        self.core.has_rewriter(player)
    }
}

#[async_trait]
impl HostAdapter for V1_21R10 {
    fn id(&self) -> &'static str {
        ADAPTER_ID
    }

    fn version(&self) -> HostVersionTag {
        self.core.version()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
            .with(Capability::PacketRewriter)
            .with(Capability::FakeBlockBreak)
            .with(Capability::Dialogs)
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
            item: ComponentItem::from(&item.overridden(name, lore)),
        };
        self.core
            .send("send_fake_item", player, SET_SLOT, &packet)
            .await
    }

    async fn reset_item_view(&self, player: PlayerId, slot: i32) -> BridgeResult<()> {
        self.core.resync_slot(player, slot).await
    }

    async fn install_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        self.core
            .install_rewriter(player, Some(PACKET_HANDLER))
            .await
    }

    async fn uninstall_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()> {
        self.core.uninstall_rewriter(player).await
    }

    async fn send_block_break_stage(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        stage: i8,
    ) -> BridgeResult<()> {
        check_stage("send_block_break_stage", stage)?;
        let packet = BlockDestructionPacket {
            breaker_id: breaker_id(player),
            pos: BlockPosition::from(pos),
            stage,
        };
        self.core
            .send("send_block_break_stage", player, BLOCK_DESTRUCTION, &packet)
            .await
    }

    async fn send_fake_block_change(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        block_state: &str,
    ) -> BridgeResult<()> {
        check_block_state("send_fake_block_change", block_state)?;
        let packet = BlockUpdatePacket {
            pos: BlockPosition::from(pos),
            state: block_state.to_string(),
        };
        self.core
            .send("send_fake_block_change", player, BLOCK_UPDATE, &packet)
            .await
    }

    async fn send_reset_block(&self, player: PlayerId, pos: &BlockPos) -> BridgeResult<()> {
        let packet = BlockResyncPacket {
            pos: BlockPosition::from(pos),
        };
        self.core
            .send("send_reset_block", player, BLOCK_RESYNC, &packet)
            .await
    }

    async fn open_dialog(&self, player: PlayerId, dialog: &Dialog) -> BridgeResult<()> {
        self.core
            .send("open_dialog", player, SHOW_DIALOG, &ShowDialogPacket::from(dialog))
            .await
    }
}
