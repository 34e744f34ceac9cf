//! Bootloader adapters: the narrow interface by which slots are promoted.
//!
//! Backends mutate bootloader environment state through the vendor
//! tooling (`barebox-state`, `fw_setenv`, `grub-editenv`). Barebox
//! applies multi-variable updates in a single invocation and is atomic;
//! U-Boot and GRUB update variables one command at a time and are
//! best-effort.

use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use fn_error_context::context;

use slotup_utils::CommandRunExt;

use crate::config::SystemConfig;
use crate::slot::Slot;

/// Default boot attempts granted when a slot is marked good.
const DEFAULT_ATTEMPTS: u32 = 3;
/// Barebox state priority for the primary slot; peers get the default.
const BAREBOX_PRIORITY_PRIMARY: u32 = 20;
const BAREBOX_PRIORITY_DEFAULT: u32 = 10;

/// A bootloader mutation observed by the test backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootEvent {
    /// Slot was made first in boot order.
    MarkPrimary(String),
    /// Slot was marked good (boot attempts replenished).
    MarkGood(String),
    /// Slot was marked bad (no boot attempts left).
    MarkBad(String),
}

/// In-memory backend for tests: records every mutation.
#[derive(Debug, Clone, Default)]
pub struct TestBootloader {
    /// Every mutation, in call order.
    pub events: Arc<Mutex<Vec<BootEvent>>>,
    /// The currently primary slot name, if any.
    pub primary: Arc<Mutex<Option<String>>>,
}

impl TestBootloader {
    /// Snapshot of the recorded events.
    pub fn recorded(&self) -> Vec<BootEvent> {
        self.events.lock().expect("poisoned").clone()
    }
}

/// The bootloader backend, selected once at context initialization.
#[derive(Debug, Clone)]
pub enum Bootloader {
    /// `barebox-state` based backend.
    Barebox,
    /// `fw_setenv`/`fw_printenv` based backend.
    Uboot,
    /// `grub-editenv` based backend.
    Grub,
    /// Recording stub for tests.
    Test(TestBootloader),
}

/// Boot order with `first` (whose bootname is given) in front, then its
/// class peers by index.
fn boot_order(config: &SystemConfig, first: &Slot, first_bootname: &str) -> String {
    let mut order = first_bootname.to_owned();
    for peer in config.slots_of_class(&first.class) {
        if peer.name == first.name {
            continue;
        }
        if let Some(bn) = peer.bootname.as_deref() {
            order.push(' ');
            order.push_str(bn);
        }
    }
    order
}

impl Bootloader {
    /// Make the slot first in boot order. Slots without a bootname are
    /// not boot-selectable; promoting them is a no-op (the group becomes
    /// active through its boot-selectable members). The test backend
    /// records every call so installs can assert whole-group promotion.
    #[context("Marking slot '{}' primary", slot.name)]
    pub fn mark_primary(&self, config: &SystemConfig, slot: &Slot) -> Result<()> {
        match (self, slot.bootname.as_deref()) {
            (Bootloader::Test(t), _) => {
                t.events
                    .lock()
                    .expect("poisoned")
                    .push(BootEvent::MarkPrimary(slot.name.clone()));
                *t.primary.lock().expect("poisoned") = Some(slot.name.clone());
                Ok(())
            }
            (_, None) => {
                tracing::debug!("Slot '{}' has no bootname, nothing to promote", slot.name);
                Ok(())
            }
            (Bootloader::Barebox, Some(bn)) => {
                // Single invocation, applied atomically by barebox-state.
                let mut cmd = Command::new("barebox-state");
                cmd.arg("-s")
                    .arg(format!("bootstate.{bn}.priority={BAREBOX_PRIORITY_PRIMARY}"));
                for peer in config.slots_of_class(&slot.class) {
                    if peer.name == slot.name {
                        continue;
                    }
                    if let Some(pbn) = peer.bootname.as_deref() {
                        cmd.arg("-s")
                            .arg(format!("bootstate.{pbn}.priority={BAREBOX_PRIORITY_DEFAULT}"));
                    }
                }
                cmd.log_debug().run_capture_stderr()
            }
            (Bootloader::Uboot, Some(bn)) => Command::new("fw_setenv")
                .args(["BOOT_ORDER", &boot_order(config, slot, bn)])
                .log_debug()
                .run_capture_stderr(),
            (Bootloader::Grub, Some(bn)) => Command::new("grub-editenv")
                .args(["-", "set"])
                .arg(format!("ORDER={}", boot_order(config, slot, bn)))
                .log_debug()
                .run_capture_stderr(),
        }
    }

    /// Replenish the slot's boot attempts. No-op for slots without a
    /// bootname, recorded by the test backend.
    #[context("Marking slot '{}' good", slot.name)]
    pub fn mark_good(&self, _config: &SystemConfig, slot: &Slot) -> Result<()> {
        match (self, slot.bootname.as_deref()) {
            (Bootloader::Test(t), _) => {
                t.events
                    .lock()
                    .expect("poisoned")
                    .push(BootEvent::MarkGood(slot.name.clone()));
                Ok(())
            }
            (_, None) => {
                tracing::debug!("Slot '{}' has no bootname, no boot attempts to track", slot.name);
                Ok(())
            }
            (Bootloader::Barebox, Some(bn)) => Command::new("barebox-state")
                .arg("-s")
                .arg(format!("bootstate.{bn}.remaining_attempts={DEFAULT_ATTEMPTS}"))
                .log_debug()
                .run_capture_stderr(),
            (Bootloader::Uboot, Some(bn)) => Command::new("fw_setenv")
                .args([
                    &format!("BOOT_{}_LEFT", bn.to_uppercase()),
                    &DEFAULT_ATTEMPTS.to_string(),
                ])
                .log_debug()
                .run_capture_stderr(),
            (Bootloader::Grub, Some(bn)) => Command::new("grub-editenv")
                .args(["-", "set"])
                .arg(format!("{}_OK=1", bn.to_uppercase()))
                .arg(format!("{}_TRY=0", bn.to_uppercase()))
                .log_debug()
                .run_capture_stderr(),
        }
    }

    /// Exhaust the slot's boot attempts so it is skipped at boot. No-op
    /// for slots without a bootname, recorded by the test backend.
    #[context("Marking slot '{}' bad", slot.name)]
    pub fn mark_bad(&self, _config: &SystemConfig, slot: &Slot) -> Result<()> {
        match (self, slot.bootname.as_deref()) {
            (Bootloader::Test(t), _) => {
                t.events
                    .lock()
                    .expect("poisoned")
                    .push(BootEvent::MarkBad(slot.name.clone()));
                Ok(())
            }
            (_, None) => {
                tracing::debug!("Slot '{}' has no bootname, nothing to disable", slot.name);
                Ok(())
            }
            (Bootloader::Barebox, Some(bn)) => Command::new("barebox-state")
                .arg("-s")
                .arg(format!("bootstate.{bn}.remaining_attempts=0"))
                .arg("-s")
                .arg(format!("bootstate.{bn}.priority=0"))
                .log_debug()
                .run_capture_stderr(),
            (Bootloader::Uboot, Some(bn)) => Command::new("fw_setenv")
                .args([&format!("BOOT_{}_LEFT", bn.to_uppercase()), "0"])
                .log_debug()
                .run_capture_stderr(),
            (Bootloader::Grub, Some(bn)) => Command::new("grub-editenv")
                .args(["-", "set"])
                .arg(format!("{}_OK=0", bn.to_uppercase()))
                .log_debug()
                .run_capture_stderr(),
        }
    }

    /// The slot name the bootloader currently prefers, if it reports one.
    #[context("Querying primary slot")]
    pub fn get_primary(&self, config: &SystemConfig) -> Result<Option<String>> {
        let first_bootname = match self {
            Bootloader::Barebox => {
                // Highest priority wins; 0 means disabled.
                let mut best: Option<(u32, &Slot)> = None;
                for slot in config.slots.values() {
                    let Some(bn) = slot.bootname.as_deref() else {
                        continue;
                    };
                    let out = Command::new("barebox-state")
                        .args(["-g", &format!("bootstate.{bn}.priority")])
                        .log_debug()
                        .run_get_string()?;
                    let prio: u32 = out.trim().parse().context("Parsing priority")?;
                    if prio > 0 && best.map_or(true, |(p, _)| prio > p) {
                        best = Some((prio, slot));
                    }
                }
                return Ok(best.map(|(_, s)| s.name.clone()));
            }
            Bootloader::Uboot => {
                let out = Command::new("fw_printenv")
                    .arg("BOOT_ORDER")
                    .log_debug()
                    .run_get_string()?;
                // Output form: BOOT_ORDER=system0 system1
                out.split_once('=')
                    .and_then(|(_, v)| v.split_whitespace().next())
                    .map(str::to_owned)
            }
            Bootloader::Grub => {
                let out = Command::new("grub-editenv")
                    .args(["-", "list"])
                    .log_debug()
                    .run_get_string()?;
                out.lines()
                    .filter_map(|l| l.split_once('='))
                    .find(|(k, _)| *k == "ORDER")
                    .and_then(|(_, v)| v.split_whitespace().next())
                    .map(str::to_owned)
            }
            Bootloader::Test(t) => return Ok(t.primary.lock().expect("poisoned").clone()),
        };
        Ok(first_bootname.and_then(|bn| {
            config
                .slots
                .values()
                .find(|s| s.bootname.as_deref() == Some(&bn))
                .map(|s| s.name.clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::TEST_CONFIG;
    use crate::config::SystemConfig;

    #[test]
    fn test_boot_order() {
        let config = SystemConfig::parse(TEST_CONFIG).unwrap();
        let order = boot_order(&config, &config.slots["rootfs.1"], "system1");
        assert_eq!(order, "system1 system0");
    }

    #[test]
    fn test_missing_bootname_is_a_noop() {
        let config = SystemConfig::parse(TEST_CONFIG).unwrap();
        // appfs slots are not boot-selectable. None of these may spawn
        // the vendor tool (which is absent here); Ok proves the skip.
        let slot = &config.slots["appfs.0"];
        Bootloader::Uboot.mark_primary(&config, slot).unwrap();
        Bootloader::Grub.mark_good(&config, slot).unwrap();
        Bootloader::Barebox.mark_bad(&config, slot).unwrap();
    }

    #[test]
    fn test_recording_backend_covers_bootnameless_slots() {
        let config = SystemConfig::parse(TEST_CONFIG).unwrap();
        let t = TestBootloader::default();
        let bl = Bootloader::Test(t.clone());
        let slot = &config.slots["appfs.1"];
        bl.mark_primary(&config, slot).unwrap();
        bl.mark_good(&config, slot).unwrap();
        assert_eq!(
            t.recorded(),
            vec![
                BootEvent::MarkPrimary("appfs.1".into()),
                BootEvent::MarkGood("appfs.1".into()),
            ]
        );
    }

    #[test]
    fn test_recording_backend() {
        let config = SystemConfig::parse(TEST_CONFIG).unwrap();
        let t = TestBootloader::default();
        let bl = Bootloader::Test(t.clone());
        let slot = &config.slots["rootfs.1"];
        bl.mark_primary(&config, slot).unwrap();
        bl.mark_good(&config, slot).unwrap();
        bl.mark_bad(&config, slot).unwrap();
        assert_eq!(
            t.recorded(),
            vec![
                BootEvent::MarkPrimary("rootfs.1".into()),
                BootEvent::MarkGood("rootfs.1".into()),
                BootEvent::MarkBad("rootfs.1".into()),
            ]
        );
        assert_eq!(bl.get_primary(&config).unwrap().as_deref(), Some("rootfs.1"));
    }
}
