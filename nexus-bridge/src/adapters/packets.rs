//! Packet shapes shared by more than one release.
//!
//! Each adapter picks the shapes its host understands; anything specific to a
//! single release lives in that adapter's module.

use serde::Serialize;

use crate::contract::{BlockPos, Dialog, ItemView, PlayerId};

// ============================================================================
// CHANNELS
// ============================================================================

pub const SYSTEM_CHAT: &str = "system_chat";
pub const SET_SLOT: &str = "container_set_slot";
pub const RESYNC_SLOT: &str = "container_resync_slot";
pub const PIPELINE: &str = "pipeline";
pub const BLOCK_DESTRUCTION: &str = "block_destruction";
pub const BLOCK_UPDATE: &str = "block_update";
pub const BLOCK_RESYNC: &str = "block_resync";
pub const SHOW_DIALOG: &str = "show_dialog";
pub const SET_CURSOR_ITEM: &str = "set_cursor_item";

/// Name of the pipeline handler that rewrites outgoing inventory packets.
pub const REWRITER_HANDLER: &str = "nexus_item_visual_rewriter";

/// Container id of the player's own inventory menu.
pub const PLAYER_CONTAINER: i32 = 0;

// ============================================================================
// TEXT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TextComponent {
    pub text: String,
    /// Lore and names default to italic on the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
}

impl TextComponent {
    pub fn plain(text: &str) -> Self {
        Self {
            text: text.to_string(),
            italic: None,
        }
    }

    pub fn upright(text: &str) -> Self {
        Self {
            text: text.to_string(),
            italic: Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemChatPacket {
    pub content: TextComponent,
    pub overlay: bool,
}

impl SystemChatPacket {
    pub fn chat(text: &str) -> Self {
        Self {
            content: TextComponent::plain(text),
            overlay: false,
        }
    }
}

// ============================================================================
// ITEMS
// ============================================================================

/// Data-component item encoding used from 1.21.8 on.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentItem {
    pub id: String,
    pub count: u8,
    pub components: ItemComponents,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ItemComponents {
    #[serde(rename = "minecraft:custom_name", skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<TextComponent>,
    #[serde(rename = "minecraft:lore", skip_serializing_if = "Vec::is_empty")]
    pub lore: Vec<TextComponent>,
}

impl From<&ItemView> for ComponentItem {
    fn from(item: &ItemView) -> Self {
        Self {
            id: item.material.clone(),
            count: item.amount,
            components: ItemComponents {
                custom_name: item.display_name.as_deref().map(TextComponent::upright),
                lore: item.lore.iter().map(|l| TextComponent::upright(l)).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetSlotPacket<I> {
    pub container_id: i32,
    pub slot: i32,
    pub item: I,
}

/// Ask the host to resend the real contents of one slot.
#[derive(Debug, Clone, Serialize)]
pub struct ResyncSlotPacket {
    pub container_id: i32,
    pub slot: i32,
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineAction {
    Install,
    Uninstall,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelinePacket {
    pub action: PipelineAction,
    pub handler: &'static str,
    /// Insert before this handler when present, else append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<&'static str>,
}

// ============================================================================
// BLOCKS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BlockPosition {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl From<&BlockPos> for BlockPosition {
    fn from(pos: &BlockPos) -> Self {
        Self {
            world: pos.world.clone(),
            x: pos.x,
            y: pos.y,
            z: pos.z,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockDestructionPacket {
    /// Overlays are keyed by breaker; the viewing player stands in for it.
    pub breaker_id: i32,
    pub pos: BlockPosition,
    pub stage: i8,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockUpdatePacket {
    pub pos: BlockPosition,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockResyncPacket {
    pub pos: BlockPosition,
}

/// Stable per-player breaker id for block destruction overlays.
pub fn breaker_id(player: PlayerId) -> i32 {
    let (high, low) = player.as_u64_pair();
    ((high ^ low) & 0x7fff_ffff) as i32
}

// ============================================================================
// DIALOGS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DialogBodyEntry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub contents: TextComponent,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogAction {
    pub label: TextComponent,
    pub action: DialogClick,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialogClick {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub command: String,
}

pub fn dialog_body(dialog: &Dialog) -> Vec<DialogBodyEntry> {
    dialog
        .body
        .iter()
        .map(|line| DialogBodyEntry {
            kind: "minecraft:plain_message",
            contents: TextComponent::plain(line),
        })
        .collect()
}

pub fn dialog_actions(dialog: &Dialog) -> Vec<DialogAction> {
    dialog
        .buttons
        .iter()
        .map(|button| DialogAction {
            label: TextComponent::plain(&button.label),
            action: DialogClick {
                kind: "run_command",
                command: format!("/{}", button.action.trim_start_matches('/')),
            },
        })
        .collect()
}

/// Dialog kind for a button list: a notice for zero or one, else a multi action.
pub fn dialog_kind(dialog: &Dialog) -> &'static str {
    if dialog.buttons.len() > 1 {
        "minecraft:multi_action"
    } else {
        "minecraft:notice"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_item_encoding() {
        let item = ItemView::new("minecraft:diamond", 3)
            .with_name("Gem")
            .with_lore(["shiny"]);
        let encoded = serde_json::to_value(ComponentItem::from(&item)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "id": "minecraft:diamond",
                "count": 3,
                "components": {
                    "minecraft:custom_name": { "text": "Gem", "italic": false },
                    "minecraft:lore": [{ "text": "shiny", "italic": false }]
                }
            })
        );
    }

    #[test]
    fn test_bare_item_has_no_components() {
        let encoded =
            serde_json::to_value(ComponentItem::from(&ItemView::new("minecraft:dirt", 1))).unwrap();
        assert_eq!(encoded["components"], json!({}));
    }

    #[test]
    fn test_breaker_id_is_stable_and_positive() {
        let player = PlayerId::from_u128(0xdead_beef_0000_0001_ffff_ffff_0000_0002);
        assert_eq!(breaker_id(player), breaker_id(player));
        assert!(breaker_id(player) >= 0);
    }

    #[test]
    fn test_dialog_kind_follows_buttons() {
        let notice = Dialog::new("Hi").button("Ok", "ok");
        assert_eq!(dialog_kind(&notice), "minecraft:notice");
        let multi = notice.button("Cancel", "cancel");
        assert_eq!(dialog_kind(&multi), "minecraft:multi_action");
        assert_eq!(dialog_actions(&multi)[1].action.command, "/cancel");
    }
}
