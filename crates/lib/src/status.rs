//! Reporting the slot inventory and its runtime state.

use anyhow::Result;
use serde::Serialize;

use crate::context::Context;
use crate::install::determine_slot_states;
use crate::slot::{Slot, SlotState};

/// One row of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    /// The slot definition from the configuration.
    #[serde(flatten)]
    pub slot: Slot,
    /// Resolved runtime state.
    pub state: SlotState,
    /// Where the slot's device is mounted, if it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

/// Resolve the state of every slot, ordered by name.
pub fn slot_status(ctx: &Context) -> Result<Vec<SlotStatus>> {
    let states = determine_slot_states(ctx)?;
    let mut out = Vec::with_capacity(ctx.config.slots.len());
    for slot in ctx.config.slots.values() {
        let state = states
            .get(&slot.name)
            .copied()
            .unwrap_or(SlotState::Unknown);
        let mountpoint = query_mountpoint(slot);
        out.push(SlotStatus {
            slot: slot.clone(),
            state,
            mountpoint,
        });
    }
    Ok(out)
}

/// Best-effort mountpoint lookup; devices outside /dev (test fixtures,
/// image files) are never mounted as slots.
fn query_mountpoint(slot: &Slot) -> Option<String> {
    if !slot.device.as_str().starts_with("/dev/") {
        return None;
    }
    match slotup_mount::is_mounted(&slot.device) {
        Ok(true) => slotup_mount::inspect_filesystem(&slot.device)
            .ok()
            .map(|fs| fs.target.into_string()),
        Ok(false) => None,
        Err(e) => {
            tracing::debug!("Cannot query mounts of {}: {e:#}", slot.device);
            None
        }
    }
}

/// Render the human-readable status report.
pub fn format_status(rows: &[SlotStatus], booted_identity: &str) -> String {
    let mut out = format!("Booted from: {booted_identity}\n");
    for row in rows {
        out.push_str(&format!(
            "  {} ({}, {}): {}{}{}\n",
            row.slot.name,
            row.slot.device,
            row.slot.fstype,
            row.state,
            if row.slot.readonly { ", readonly" } else { "" },
            match &row.mountpoint {
                Some(m) => format!(", mounted at {m}"),
                None => String::new(),
            },
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{Bootloader, TestBootloader};
    use crate::config::tests::TEST_CONFIG;
    use crate::context::ContextBuilder;

    fn test_context() -> Context {
        let dir = tempfile::tempdir().unwrap();
        let confpath = dir.path().join("system.conf");
        std::fs::write(&confpath, TEST_CONFIG).unwrap();
        ContextBuilder::new(confpath.to_str().unwrap())
            .bootslot("rootfs.0")
            .bootloader(Bootloader::Test(TestBootloader::default()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_status_rows() {
        let ctx = test_context();
        let rows = slot_status(&ctx).unwrap();
        assert_eq!(rows.len(), 5);
        let booted: Vec<_> = rows
            .iter()
            .filter(|r| r.state == SlotState::Booted)
            .map(|r| r.slot.name.as_str())
            .collect();
        assert_eq!(booted, ["rootfs.0"]);
    }

    #[test]
    fn test_status_serializes() {
        let ctx = test_context();
        let rows = slot_status(&ctx).unwrap();
        let json = serde_json::to_string_pretty(&rows).unwrap();
        assert!(json.contains("\"state\": \"booted\""));
        assert!(json.contains("\"device\": \"/dev/sda0\""));
    }

    #[test]
    fn test_format_status() {
        let ctx = test_context();
        let rows = slot_status(&ctx).unwrap();
        let text = format_status(&rows, "rootfs.0");
        assert!(text.starts_with("Booted from: rootfs.0\n"));
        assert!(text.contains("rescue.0 (/dev/mtd4, raw): inactive, readonly"));
    }
}
