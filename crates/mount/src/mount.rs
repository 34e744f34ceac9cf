//! Helpers for interacting with mounts: querying the mount table via
//! `findmnt` and setting up scoped (auto-released) mounts.
//!
//! Mounts acquired through this crate are represented by a [`MountGuard`];
//! dropping the guard unmounts. Callers that care about unmount errors
//! should use [`MountGuard::unmount`] explicitly.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use slotup_utils::CommandRunExt;

/// Well-known identifier for mount status inspection.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
struct FindmntOutput {
    filesystems: Vec<Filesystem>,
}

/// A mounted filesystem as reported by `findmnt`.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// The mountpoint.
    pub target: Utf8PathBuf,
    /// The backing source (usually a device path).
    pub source: String,
    /// Filesystem type.
    pub fstype: String,
    /// Mount options.
    pub options: String,
}

fn run_findmnt(args: &[&str], path: &str) -> Result<FindmntOutput> {
    Command::new("findmnt")
        .args(["-J", "-v", "--output=SOURCE,TARGET,FSTYPE,OPTIONS"])
        .args(args)
        .arg(path)
        .log_debug()
        .run_and_parse_json()
}

/// Inspect the filesystem mounted at the given path.
#[context("Inspecting filesystem {path}")]
pub fn inspect_filesystem(path: &Utf8Path) -> Result<Filesystem> {
    run_findmnt(&[], path.as_str())?
        .filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("findmnt returned no data for {path}"))
}

/// Check whether the given source device is currently mounted anywhere.
#[context("Querying mounts of {device}")]
pub fn is_mounted(device: &Utf8Path) -> Result<bool> {
    // findmnt exits with 1 when the source has no mounts, which is not an
    // error for us.
    let o = Command::new("findmnt")
        .args(["--source", device.as_str()])
        .log_debug()
        .output()
        .context("Spawning findmnt")?;
    Ok(o.status.success())
}

/// A scoped mount. The mount is released when the guard is dropped
/// (best-effort, logged) or explicitly via [`Self::unmount`].
#[derive(Debug)]
pub struct MountGuard {
    mountpoint: Utf8PathBuf,
    armed: bool,
}

impl MountGuard {
    /// The location this mount is attached to.
    pub fn mountpoint(&self) -> &Utf8Path {
        &self.mountpoint
    }

    /// Unmount now, reporting errors.
    pub fn unmount(mut self) -> Result<()> {
        self.armed = false;
        unmount(&self.mountpoint)
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = unmount(&self.mountpoint) {
            tracing::warn!("Failed to unmount {}: {e:#}", self.mountpoint);
        }
    }
}

/// Unmount the filesystem at the given path.
#[context("Unmounting {mountpoint}")]
pub fn unmount(mountpoint: &Utf8Path) -> Result<()> {
    Command::new("umount")
        .arg(mountpoint.as_str())
        .log_debug()
        .run_capture_stderr()
}

/// Loopback-mount an image file read-only. A `sizelimit` restricts the
/// loop device to a prefix of the file, which is how signed images with
/// trailing metadata are mounted without exposing the trailer.
#[context("Loop mounting {image} at {mountpoint}")]
pub fn mount_loop(
    image: &Utf8Path,
    mountpoint: &Utf8Path,
    fstype: Option<&str>,
    sizelimit: Option<u64>,
) -> Result<MountGuard> {
    let mut opts = String::from("ro,loop");
    if let Some(limit) = sizelimit {
        opts.push_str(&format!(",sizelimit={limit}"));
    }
    let mut cmd = Command::new("mount");
    if let Some(t) = fstype {
        cmd.args(["-t", t]);
    }
    cmd.args(["-o", &opts, image.as_str(), mountpoint.as_str()])
        .log_debug()
        .run_capture_stderr()?;
    Ok(MountGuard {
        mountpoint: mountpoint.to_owned(),
        armed: true,
    })
}

/// Mount a block device, optionally writable.
#[context("Mounting {device} at {mountpoint}")]
pub fn mount_device(
    device: &Utf8Path,
    mountpoint: &Utf8Path,
    fstype: Option<&str>,
    writable: bool,
) -> Result<MountGuard> {
    let opts = if writable { "rw" } else { "ro" };
    let mut cmd = Command::new("mount");
    if let Some(t) = fstype {
        cmd.args(["-t", t]);
    }
    cmd.args(["-o", opts, device.as_str(), mountpoint.as_str()])
        .log_debug()
        .run_capture_stderr()?;
    Ok(MountGuard {
        mountpoint: mountpoint.to_owned(),
        armed: true,
    })
}
