//! Loading and validation of the system configuration (`system.conf`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::UpdateError;
use crate::keyfile::KeyFile;
use crate::slot::{parse_slot_name, Slot};

/// Default location of the exclusive install lock.
pub const DEFAULT_LOCKFILE: &str = "/run/slotup/install.lock";
/// Default prefix under which bundle and slot mounts are created.
pub const DEFAULT_MOUNT_PREFIX: &str = "/run/slotup/mounts";

/// Which bootloader backend mutates boot state for this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderKind {
    /// `barebox-state`, atomic multi-variable updates.
    Barebox,
    /// `fw_setenv`/`fw_printenv`, non-atomic.
    Uboot,
    /// `grub-editenv`.
    Grub,
}

impl std::str::FromStr for BootloaderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "barebox" => Ok(Self::Barebox),
            "uboot" => Ok(Self::Uboot),
            "grub" => Ok(Self::Grub),
            o => Err(UpdateError::Config(format!("unknown bootloader '{o}'")).into()),
        }
    }
}

/// The static system description: identity, bootloader choice and the
/// slot inventory. Immutable once loaded into a `Context`.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// The device identity a manifest's `compatible` must match.
    pub compatible: String,
    /// Selected bootloader backend.
    pub bootloader: BootloaderKind,
    /// Mount prefix for scoped bundle and slot mounts.
    pub mountprefix: Utf8PathBuf,
    /// Path of the exclusive install lockfile.
    pub lockfile: Utf8PathBuf,
    /// CA bundle anchoring signature verification, if configured.
    pub keyring: Option<Utf8PathBuf>,
    /// Slot inventory, keyed by slot name. BTreeMap keeps iteration
    /// deterministic.
    pub slots: BTreeMap<String, Slot>,
}

impl SystemConfig {
    /// Load and validate a configuration file.
    #[context("Loading system config {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Reading config")?;
        Self::parse(&content)
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let kf =
            KeyFile::parse(content).map_err(|e| UpdateError::Config(format!("{e:#}")))?;

        let system = kf
            .section("system")
            .ok_or_else(|| UpdateError::Config("missing [system] section".into()))?;
        let compatible = system
            .get("compatible")
            .ok_or_else(|| UpdateError::Config("missing 'compatible' in [system]".into()))?
            .to_owned();
        let bootloader = system
            .get("bootloader")
            .unwrap_or("uboot")
            .parse::<BootloaderKind>()?;
        let mountprefix = Utf8PathBuf::from(system.get("mountprefix").unwrap_or(DEFAULT_MOUNT_PREFIX));
        let lockfile = Utf8PathBuf::from(system.get("lockfile").unwrap_or(DEFAULT_LOCKFILE));

        let keyring = kf
            .section("keyring")
            .and_then(|s| s.get("path"))
            .map(Utf8PathBuf::from);

        let mut slots = BTreeMap::new();
        for section in &kf.sections {
            let Some(name) = section.name.strip_prefix("slot.") else {
                if !matches!(section.name.as_str(), "system" | "keyring") {
                    tracing::warn!("Ignoring unknown config section [{}]", section.name);
                }
                continue;
            };
            let (class, index) = parse_slot_name(name)
                .map_err(|e| UpdateError::Config(format!("section [{}]: {e:#}", section.name)))?;
            let device = section.get("device").ok_or_else(|| {
                UpdateError::Config(format!("slot '{name}' is missing 'device'"))
            })?;
            let slot = Slot {
                name: name.to_owned(),
                class: class.to_owned(),
                index,
                device: Utf8PathBuf::from(device),
                fstype: section.get("type").unwrap_or("ext4").to_owned(),
                bootname: section.get("bootname").map(str::to_owned),
                parent: section.get("parent").map(str::to_owned),
                readonly: section.get("readonly") == Some("true"),
            };
            if slots.insert(slot.name.clone(), slot).is_some() {
                return Err(UpdateError::Config(format!("duplicate slot '{name}'")).into());
            }
        }

        let config = Self {
            compatible,
            bootloader,
            mountprefix,
            lockfile,
            keyring,
            slots,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for slot in self.slots.values() {
            // Parent links must resolve, and chains must terminate.
            let mut seen = vec![slot.name.as_str()];
            let mut cur = slot;
            while let Some(parent) = cur.parent.as_deref() {
                if seen.contains(&parent) {
                    return Err(UpdateError::Config(format!(
                        "parent cycle involving slot '{}'",
                        slot.name
                    ))
                    .into());
                }
                cur = self.slots.get(parent).ok_or_else(|| {
                    UpdateError::Config(format!(
                        "slot '{}' references unknown parent '{parent}'",
                        slot.name
                    ))
                })?;
                seen.push(cur.name.as_str());
            }
        }
        Ok(())
    }

    /// All slots of the given class, ordered by index.
    pub fn slots_of_class(&self, class: &str) -> Vec<&Slot> {
        let mut v: Vec<&Slot> = self.slots.values().filter(|s| s.class == class).collect();
        v.sort_by_key(|s| s.index);
        v
    }

    /// Walk the parent chain of a slot, excluding the slot itself.
    pub fn ancestors<'a>(&'a self, slot: &'a Slot) -> impl Iterator<Item = &'a Slot> + 'a {
        std::iter::successors(
            slot.parent.as_deref().and_then(|p| self.slots.get(p)),
            |cur| cur.parent.as_deref().and_then(|p| self.slots.get(p)),
        )
    }
}
