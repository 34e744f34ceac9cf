//! Signed update bundles.
//!
//! A bundle is a single file: a read-only squashfs image holding the
//! manifest and all payloads, followed by a detached PKCS#7 signature
//! over the image bytes, followed by an 8-byte little-endian trailer
//! encoding the signature length:
//!
//! ```text
//! [ payload: squashfs image ][ signature ][ u64-le signature length ]
//! ```
//!
//! Verification happens strictly before the image is ever mounted, and
//! the loop mount is limited to the payload region so the trailer is
//! never exposed to the kernel.

use std::io::Read;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use slotup_mount::{mount_loop, MountGuard};
use slotup_utils::CommandRunExt;

use crate::context::Context as UpdateContext;
use crate::error::UpdateError;
use crate::manifest::MANIFEST_NAME;
use crate::signature::{load_keyring, sign_detached, verify_detached, SignerIdentity};

/// Size of the fixed trailer at the end of a bundle.
pub const TRAILER_LEN: u64 = 8;

/// Byte layout of a bundle, derived from the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleLayout {
    /// Length of the filesystem image at the start of the file.
    pub payload_len: u64,
    /// Length of the detached signature following the payload.
    pub signature_len: u64,
}

/// Read and sanity-check the trailer of a bundle file.
#[context("Reading bundle layout of {path}")]
pub fn read_layout(path: &Utf8Path) -> Result<BundleLayout> {
    let total = std::fs::metadata(path).context("Inspecting bundle")?.len();
    if total <= TRAILER_LEN {
        return Err(UpdateError::Verify("bundle too small for trailer".into()).into());
    }
    let mut f = std::fs::File::open(path).context("Opening bundle")?;
    let mut trailer = [0u8; TRAILER_LEN as usize];
    {
        use std::io::{Seek, SeekFrom};
        f.seek(SeekFrom::End(-(TRAILER_LEN as i64)))
            .context("Seeking to trailer")?;
    }
    f.read_exact(&mut trailer).context("Reading trailer")?;
    layout_from(total, u64::from_le_bytes(trailer))
}

fn layout_from(total: u64, signature_len: u64) -> Result<BundleLayout> {
    let Some(rest) = total
        .checked_sub(TRAILER_LEN)
        .and_then(|r| r.checked_sub(signature_len))
    else {
        return Err(UpdateError::Verify("bundle trailer is inconsistent".into()).into());
    };
    if signature_len == 0 || rest == 0 {
        return Err(UpdateError::Verify("bundle trailer is inconsistent".into()).into());
    }
    Ok(BundleLayout {
        payload_len: rest,
        signature_len,
    })
}

/// Append a detached signature and the trailer to a payload file.
#[context("Appending signature to {path}")]
pub fn append_signature(path: &Utf8Path, signature: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .context("Opening bundle for append")?;
    f.write_all(signature).context("Writing signature")?;
    f.write_all(&(signature.len() as u64).to_le_bytes())
        .context("Writing trailer")?;
    f.sync_all().context("Syncing bundle")?;
    Ok(())
}

/// Package a content directory as a signed bundle.
///
/// The directory must contain `manifest.raucm` and every payload it
/// references; run `update_manifest` first so the checksums are current.
#[context("Creating bundle {bundlepath}")]
pub fn create_bundle(
    ctx: &UpdateContext,
    bundlepath: &Utf8Path,
    contentdir: &Utf8Path,
) -> Result<()> {
    if !contentdir.join(MANIFEST_NAME).exists() {
        return Err(
            UpdateError::Manifest(format!("{contentdir} contains no {MANIFEST_NAME}")).into(),
        );
    }
    if bundlepath.exists() {
        anyhow::bail!("refusing to overwrite existing {bundlepath}");
    }
    let (certpath, keypath) = match (&ctx.certpath, &ctx.keypath) {
        (Some(c), Some(k)) => (c, k),
        _ => return Err(UpdateError::Config("bundle creation requires --cert and --key".into()).into()),
    };

    Command::new("mksquashfs")
        .args([contentdir.as_str(), bundlepath.as_str()])
        .args(["-all-root", "-noappend", "-no-progress"])
        .log_debug()
        .run_capture_stderr()
        .context("Creating squashfs image")?;

    let payload = std::fs::read(bundlepath).context("Reading back payload image")?;
    let signature = sign_detached(&payload, certpath, keypath)?;
    append_signature(bundlepath, &signature)?;
    tracing::info!(
        "Created bundle {bundlepath} ({} payload + {} signature bytes)",
        payload.len(),
        signature.len()
    );
    Ok(())
}

/// Verify a bundle's trailer and signature against the keyring. Returns
/// the signer identity; any failure is fatal for the transaction.
#[context("Verifying bundle {path}")]
pub fn verify_bundle(ctx: &UpdateContext, path: &Utf8Path) -> Result<SignerIdentity> {
    let layout = read_layout(path)?;
    let mut f = std::fs::File::open(path).context("Opening bundle")?;
    // Pkcs7::verify wants the signed data as one contiguous slice, so
    // the payload region is read into memory here.
    let mut payload = vec![0u8; layout.payload_len as usize];
    f.read_exact(&mut payload).context("Reading payload")?;
    let mut signature = vec![0u8; layout.signature_len as usize];
    f.read_exact(&mut signature).context("Reading signature")?;

    let keyring = load_keyring(ctx.keyring_path()?)?;
    let signer = verify_detached(&payload, &signature, &keyring)?;
    tracing::info!("Bundle {path} verified, signed by {signer}");
    Ok(signer)
}

/// Mount the payload region of a verified bundle read-only. The returned
/// guard unmounts on drop; the mountpoint lives under the configured
/// mount prefix.
#[context("Mounting bundle {path}")]
pub fn mount_bundle(ctx: &UpdateContext, path: &Utf8Path) -> Result<(MountGuard, Utf8PathBuf)> {
    let layout = read_layout(path)?;
    let mountpoint = ctx.config.mountprefix.join("bundle");
    std::fs::create_dir_all(&mountpoint).context("Creating bundle mountpoint")?;
    let guard = mount_loop(path, &mountpoint, Some("squashfs"), Some(layout.payload_len))?;
    Ok((guard, mountpoint))
}
