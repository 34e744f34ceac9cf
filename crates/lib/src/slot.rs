//! Slot identity and runtime state.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::Serialize;

/// Split a dotted slot name like `rootfs.0` into class and index.
pub fn parse_slot_name(name: &str) -> Result<(&str, u32)> {
    let (class, index) = name
        .rsplit_once('.')
        .with_context(|| format!("Slot name '{name}' is not of the form <class>.<index>"))?;
    anyhow::ensure!(!class.is_empty(), "Slot name '{name}' has an empty class");
    let index = index
        .parse()
        .with_context(|| format!("Slot name '{name}' has a non-numeric index"))?;
    Ok((class, index))
}

/// A named storage region that can receive update payloads.
///
/// Definitions come from `system.conf` and are immutable for the process
/// lifetime; runtime state lives in the resolver's state map, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    /// Dotted name, `<class>.<index>`.
    pub name: String,
    /// The abstract role shared by redundant peers (e.g. `rootfs`).
    pub class: String,
    /// Index among the redundant peers of the class.
    pub index: u32,
    /// Block device (or backing file) path.
    pub device: Utf8PathBuf,
    /// Filesystem type tag, used when the slot is mounted for file copies.
    pub fstype: String,
    /// Name the bootloader knows this slot by, if boot-selectable.
    pub bootname: Option<String>,
    /// Name of the slot this one is layered on, if any.
    pub parent: Option<String>,
    /// Read-only slots are never selected as install targets.
    pub readonly: bool,
}

/// Runtime state of a slot, computed by the state resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Not yet resolved.
    Unknown,
    /// Not in use by the running system.
    Inactive,
    /// In use (or elected primary), but not the slot we booted from.
    Active,
    /// The slot the running system was started from. Implies active.
    Booted,
}

impl SlotState {
    /// Whether the slot is in use by the running system.
    pub fn is_active(self) -> bool {
        matches!(self, SlotState::Active | SlotState::Booted)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotState::Unknown => "unknown",
            SlotState::Inactive => "inactive",
            SlotState::Active => "active",
            SlotState::Booted => "booted",
        };
        f.write_str(s)
    }
}
