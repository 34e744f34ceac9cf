//! Determining which slot the running system was booted from.
//!
//! The canonical source is the kernel command line: the bootloader
//! appends `slotup.slot=<bootname>` when it selects a slot, and `root=`
//! serves as a fallback for setups that boot the rootfs device directly.

use anyhow::{Context, Result};

/// Kernel argument set by the bootloader to identify the booted slot.
const SLOT_ARG: &str = "slotup.slot";

/// Where the running system's boot identity comes from. Selected once at
/// context initialization; a tagged variant instead of dynamic dispatch
/// since the set of providers is closed.
#[derive(Debug, Clone)]
pub enum BootnameProvider {
    /// Parse `/proc/cmdline`.
    Cmdline,
    /// A fixed identity: the `bootslot` config override and tests.
    Fixed(String),
}

impl BootnameProvider {
    /// The identity of the booted slot: a bootname, a slot name or a
    /// device path, matched against the inventory by the state resolver.
    pub fn get_bootname(&self) -> Result<String> {
        match self {
            BootnameProvider::Fixed(name) => Ok(name.clone()),
            BootnameProvider::Cmdline => get_cmdline_bootname(),
        }
    }
}

/// Read the booted slot identity from `/proc/cmdline`.
pub fn get_cmdline_bootname() -> Result<String> {
    let cmdline = std::fs::read_to_string("/proc/cmdline").context("Reading /proc/cmdline")?;
    bootname_from_cmdline(&cmdline)
}

fn bootname_from_cmdline(cmdline: &str) -> Result<String> {
    find_arg(cmdline, SLOT_ARG)
        .or_else(|| find_arg(cmdline, "root"))
        .map(str::to_owned)
        .with_context(|| format!("No '{SLOT_ARG}=' or 'root=' in kernel command line"))
}

/// Find the value of `key=` in a kernel command line, honoring double
/// quotes around values containing whitespace.
fn find_arg<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    let mut in_quotes = false;
    cmdline
        .split(move |c: char| {
            if c == '"' {
                in_quotes = !in_quotes;
            }
            !in_quotes && c.is_whitespace()
        })
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.trim_matches('"'))
}
