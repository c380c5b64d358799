//! The stable host contract feature modules program against.
//!
//! [`HostAdapter`] is additive-only. An operation shipped once stays on the
//! trait for good; an adapter that cannot do it natively turns it into a
//! no-op or a fallback, never an "unsupported" error. Operations added for
//! newer hosts come with default bodies so older adapters keep compiling
//! untouched.
//!
//! Use [`HostAdapter::capabilities`] to choose a presentation up front instead
//! of probing by calling.

use async_trait::async_trait;
use nexus_core::{BridgeError, BridgeResult, HostVersionTag};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Player identity as the host knows it.
pub type PlayerId = uuid::Uuid;

/// Highest player inventory slot: 36 hotbar/main slots, 4 armor, 1 offhand.
pub const MAX_PLAYER_SLOT: i32 = 40;

/// Block crack stages run 0..=9; -1 removes the overlay.
pub const MIN_BREAK_STAGE: i8 = -1;
pub const MAX_BREAK_STAGE: i8 = 9;

// ============================================================================
// VALUE TYPES
// ============================================================================

/// Client-side view of an item stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    /// Namespaced material id, e.g. `minecraft:diamond_sword`.
    pub material: String,
    pub amount: u8,
    pub display_name: Option<String>,
    pub lore: Vec<String>,
}

impl ItemView {
    pub fn new(material: impl Into<String>, amount: u8) -> Self {
        Self {
            material: material.into(),
            amount,
            display_name: None,
            lore: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_lore<I, S>(mut self, lore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lore = lore.into_iter().map(Into::into).collect();
        self
    }

    /// Copy with the given overrides applied. `None` keeps the original.
    pub fn overridden(&self, name: Option<&str>, lore: Option<&[String]>) -> Self {
        let mut view = self.clone();
        if let Some(name) = name {
            view.display_name = Some(name.to_string());
        }
        if let Some(lore) = lore {
            view.lore = lore.to_vec();
        }
        view
    }
}

/// Absolute block position in a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{},{}", self.world, self.x, self.y, self.z)
    }
}

/// A button on a [`Dialog`]. `action` is the command run on click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogButton {
    pub label: String,
    pub action: String,
}

/// A modal dialog shown to one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialog {
    pub title: String,
    pub body: Vec<String>,
    pub buttons: Vec<DialogButton>,
    /// Whether escape closes the dialog.
    pub closable: bool,
}

impl Dialog {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: Vec::new(),
            buttons: Vec::new(),
            closable: true,
        }
    }

    pub fn line(mut self, text: impl Into<String>) -> Self {
        self.body.push(text.into());
        self
    }

    pub fn button(mut self, label: impl Into<String>, action: impl Into<String>) -> Self {
        self.buttons.push(DialogButton {
            label: label.into(),
            action: action.into(),
        });
        self
    }

    /// Plain-chat rendering used where dialogs are not available.
    pub fn as_chat_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.body.len() + 2);
        lines.push(self.title.clone());
        lines.extend(self.body.iter().cloned());
        if !self.buttons.is_empty() {
            let buttons: Vec<String> = self
                .buttons
                .iter()
                .map(|b| format!("[{}] /{}", b.label, b.action.trim_start_matches('/')))
                .collect();
            lines.push(buttons.join("  "));
        }
        lines
    }
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Optional operations an adapter may implement natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Outgoing inventory packets can be rewritten per player.
    PacketRewriter,
    /// Block crack overlays and per-player block changes.
    FakeBlockBreak,
    /// Native dialog screens (otherwise rendered as chat).
    Dialogs,
    /// Dedicated cursor (carried item) packets.
    CursorItem,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::PacketRewriter,
        Capability::FakeBlockBreak,
        Capability::Dialogs,
        Capability::CursorItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PacketRewriter => "packet_rewriter",
            Self::FakeBlockBreak => "fake_block_break",
            Self::Dialogs => "dialogs",
            Self::CursorItem => "cursor_item",
        }
    }
}

/// Set of [`Capability`] values an adapter supports natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    bits: u8,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities { bits: 0 };

    fn bit(capability: Capability) -> u8 {
        match capability {
            Capability::PacketRewriter => 1,
            Capability::FakeBlockBreak => 1 << 1,
            Capability::Dialogs => 1 << 2,
            Capability::CursorItem => 1 << 3,
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.bits |= Self::bit(capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.bits & Self::bit(capability) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(move |capability| self.supports(*capability))
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::NONE, |caps, capability| caps.with(capability))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

// ============================================================================
// ARGUMENT CHECKS
// ============================================================================

pub fn check_slot(operation: &str, slot: i32) -> BridgeResult<()> {
    if (0..=MAX_PLAYER_SLOT).contains(&slot) {
        return Ok(());
    }
    Err(BridgeError::InvalidArgument {
        operation: operation.to_string(),
        reason: format!("slot {} outside 0..={}", slot, MAX_PLAYER_SLOT),
    })
}

pub fn check_stage(operation: &str, stage: i8) -> BridgeResult<()> {
    if (MIN_BREAK_STAGE..=MAX_BREAK_STAGE).contains(&stage) {
        return Ok(());
    }
    Err(BridgeError::InvalidArgument {
        operation: operation.to_string(),
        reason: format!(
            "break stage {} outside {}..={}",
            stage, MIN_BREAK_STAGE, MAX_BREAK_STAGE
        ),
    })
}

/// Block states look like `minecraft:oak_stairs[facing=north]`: never empty,
/// never containing whitespace.
pub fn check_block_state(operation: &str, block_state: &str) -> BridgeResult<()> {
    let reason = if block_state.is_empty() {
        "block state is empty"
    } else if block_state.chars().any(char::is_whitespace) {
        "block state contains whitespace"
    } else {
        return Ok(());
    };
    Err(BridgeError::InvalidArgument {
        operation: operation.to_string(),
        reason: reason.to_string(),
    })
}

pub fn check_item(operation: &str, item: &ItemView) -> BridgeResult<()> {
    let invalid = |reason: &str| BridgeError::InvalidArgument {
        operation: operation.to_string(),
        reason: reason.to_string(),
    };
    if item.material.trim().is_empty() {
        return Err(invalid("item material is empty"));
    }
    if item.amount == 0 || item.amount > 99 {
        return Err(invalid("item amount must be within 1..=99"));
    }
    Ok(())
}

/// Map a player inventory slot (0-8 hotbar, 9-35 main, 36-39 boots to helmet,
/// 40 offhand) to the index the client's inventory menu uses.
pub fn menu_slot(slot: i32) -> i32 {
    match slot {
        0..=8 => slot + 36,
        36..=39 => 44 - slot,
        40 => 45,
        other => other,
    }
}

// ============================================================================
// CONTRACT
// ============================================================================

/// Host operations available to feature modules, implemented once per
/// supported host release.
#[async_trait]
pub trait HostAdapter: Send + Sync + fmt::Debug {
    /// Registry id, e.g. `v1_21_r8`.
    fn id(&self) -> &'static str;

    /// The host version this adapter was resolved for.
    fn version(&self) -> HostVersionTag;

    fn capabilities(&self) -> Capabilities;

    // ----- mandatory ----------------------------------------------------

    async fn send_message(&self, player: PlayerId, text: &str) -> BridgeResult<()>;

    /// Show `item` in `slot` to `player` only, with optional name and lore
    /// overrides. The server-side stack is untouched.
    async fn send_fake_item(
        &self,
        player: PlayerId,
        slot: i32,
        item: &ItemView,
        name: Option<&str>,
        lore: Option<&[String]>,
    ) -> BridgeResult<()>;

    async fn send_fake_item_lore(
        &self,
        player: PlayerId,
        slot: i32,
        item: &ItemView,
        lore: &[String],
    ) -> BridgeResult<()> {
        self.send_fake_item(player, slot, item, None, Some(lore))
            .await
    }

    async fn send_fake_item_name(
        &self,
        player: PlayerId,
        slot: i32,
        item: &ItemView,
        name: &str,
    ) -> BridgeResult<()> {
        self.send_fake_item(player, slot, item, Some(name), None)
            .await
    }

    /// Show the server-side stack in `slot` again.
    async fn reset_item_view(&self, player: PlayerId, slot: i32) -> BridgeResult<()>;

    async fn reset_all_items(&self, player: PlayerId) -> BridgeResult<()> {
        for slot in 0..=MAX_PLAYER_SLOT {
            self.reset_item_view(player, slot).await?;
        }
        Ok(())
    }

    /// Start rewriting outgoing inventory packets for `player`. Idempotent.
    async fn install_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()>;

    /// Stop rewriting for `player`. Idempotent.
    async fn uninstall_packet_rewriter(&self, player: PlayerId) -> BridgeResult<()>;

    // ----- added for newer hosts -----------------------------------------

    async fn send_block_break_stage(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        stage: i8,
    ) -> BridgeResult<()> {
        check_stage("send_block_break_stage", stage)?;
        tracing::debug!(adapter = self.id(), player = %player, pos = %pos, "block break overlay not available");
        Ok(())
    }

    async fn send_fake_block_change(
        &self,
        player: PlayerId,
        pos: &BlockPos,
        block_state: &str,
    ) -> BridgeResult<()> {
        check_block_state("send_fake_block_change", block_state)?;
        tracing::debug!(adapter = self.id(), player = %player, pos = %pos, block_state, "fake block change not available");
        Ok(())
    }

    async fn send_reset_block(&self, player: PlayerId, pos: &BlockPos) -> BridgeResult<()> {
        tracing::debug!(adapter = self.id(), player = %player, pos = %pos, "block reset not available");
        Ok(())
    }

    /// Open `dialog`. Without native dialogs it is sent as chat lines.
    async fn open_dialog(&self, player: PlayerId, dialog: &Dialog) -> BridgeResult<()> {
        for line in dialog.as_chat_lines() {
            self.send_message(player, &line).await?;
        }
        Ok(())
    }

    async fn send_fake_cursor_item(
        &self,
        player: PlayerId,
        item: &ItemView,
        _name: Option<&str>,
        _lore: Option<&[String]>,
    ) -> BridgeResult<()> {
        check_item("send_fake_cursor_item", item)?;
        tracing::debug!(adapter = self.id(), player = %player, "cursor item packets not available");
        Ok(())
    }

    async fn reset_cursor_item(&self, player: PlayerId) -> BridgeResult<()> {
        tracing::debug!(adapter = self.id(), player = %player, "cursor item packets not available");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
