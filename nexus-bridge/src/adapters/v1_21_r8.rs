//! Adapter for 1.21.8 and 1.21.9 hosts.
//!
//! First release with data-component items, native dialogs and per-player
//! block updates. The rewriter handler is appended to the pipeline.

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

pub const ADAPTER_ID: &str = "v1_21_r8";

const REQUIRED_CHANNELS: &[&str] = &[
    SYSTEM_CHAT,
    SET_SLOT,
    RESYNC_SLOT,
    PIPELINE,
    BLOCK_DESTRUCTION,
    BLOCK_UPDATE,
    BLOCK_RESYNC,
    SHOW_DIALOG,
];

#[derive(Debug, Clone, Serialize)]
struct ShowDialogPacket {
    #[serde(rename = "type")]
    kind: &'static str,
    title: TextComponent,
    body: Vec<DialogBodyEntry>,
    actions: Vec<DialogAction>,
    can_close_with_escape: bool,
}

impl From<&Dialog> for ShowDialogPacket {
    fn from(dialog: &Dialog) -> Self {
        Self {
            kind: dialog_kind(dialog),
            title: TextComponent::plain(&dialog.title),
            body: dialog_body(dialog),
            actions: dialog_actions(dialog),
            can_close_with_escape: dialog.closable,
        }
    }
}

#[derive(Debug)]
pub struct V1_21R8 {
    core: AdapterCore,
}

impl V1_21R8 {
    pub fn new(version: HostVersionTag, host: Arc<dyn HostConnection>) -> BridgeResult<Self> {
        require_channels(ADAPTER_ID, host.as_ref(), REQUIRED_CHANNELS)?;
        Ok(Self {
            core: AdapterCore::new(ADAPTER_ID, host, version),
        })
    }

    pub fn has_packet_rewriter(&self, player: PlayerId) -> bool {
        self.core.has_rewriter(player)
    }
}

#[async_trait]
impl HostAdapter for V1_21R8 {
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
        self.core.install_rewriter(player, None).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dialog_packet_shape() {
        let dialog = Dialog::new("Vote").line("Pick one").button("Yes", "vote yes");
        let encoded = serde_json::to_value(ShowDialogPacket::from(&dialog)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "minecraft:notice",
                "title": { "text": "Vote" },
                "body": [{ "type": "minecraft:plain_message", "contents": { "text": "Pick one" } }],
                "actions": [{
                    "label": { "text": "Yes" },
                    "action": { "type": "run_command", "command": "/vote yes" }
                }],
                "can_close_with_escape": true
            })
        );
    }
}
