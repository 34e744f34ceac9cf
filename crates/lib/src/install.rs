//! The install transaction: state resolution, target selection, payload
//! writes and bootloader promotion.
//!
//! An install is all-or-nothing with respect to boot state: every
//! payload is verified and written before the first bootloader mutation,
//! so a failure at any earlier point leaves the currently booted slot
//! selected.

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use slotup_mount::{is_mounted, mount_device};

use crate::bundle::{mount_bundle, verify_bundle};
use crate::context::Context;
use crate::digest::{copy_and_digest, sha256_hex_file, write_zeros};
use crate::error::UpdateError;
use crate::fetch::{fetch_signed_manifest, fetch_to};
use crate::manifest::{load_manifest, Manifest, ManifestFile, PayloadTarget, MANIFEST_NAME};
use crate::signature::{load_keyring, verify_detached};
use crate::slot::{Slot, SlotState};

/// Exclusive advisory lock serializing installs on a system. Held for
/// the whole transaction; released when dropped.
#[derive(Debug)]
pub struct InstallLock {
    _file: std::fs::File,
}

impl InstallLock {
    /// Take the lock, failing immediately if another install holds it.
    #[context("Acquiring install lock {path}")]
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Creating lock directory")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .context("Opening lockfile")?;
        match rustix::fs::flock(&file, rustix::fs::FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => Err(UpdateError::Busy.into()),
            Err(e) => Err(anyhow::Error::new(e).context("Locking")),
        }
    }
}

/// Resolve the runtime state of every slot in the inventory.
///
/// The booted slot is identified by matching the boot identity (from the
/// kernel command line or an override) against slot names, bootnames and
/// device paths. Its ancestors are booted too: the running system is
/// using them. Slots layered on the booted slot are active. If the
/// bootloader reports a primary that is not otherwise in use it is
/// marked active as well, covering the window between an install and the
/// reboot into it.
pub fn determine_slot_states(ctx: &Context) -> Result<BTreeMap<String, SlotState>> {
    let identity = ctx.bootname().get_bootname()?;
    let config = &ctx.config;

    let booted = config
        .slots
        .values()
        .find(|s| {
            s.name == identity
                || s.bootname.as_deref() == Some(identity.as_str())
                || s.device == identity
        })
        .ok_or_else(|| {
            UpdateError::Config(format!("boot identity '{identity}' matches no slot"))
        })?;

    let mut states: BTreeMap<String, SlotState> = config
        .slots
        .keys()
        .map(|name| (name.clone(), SlotState::Inactive))
        .collect();

    states.insert(booted.name.clone(), SlotState::Booted);
    for ancestor in config.ancestors(booted) {
        states.insert(ancestor.name.clone(), SlotState::Booted);
    }
    for slot in config.slots.values() {
        if config.ancestors(slot).any(|a| a.name == booted.name) {
            states.insert(slot.name.clone(), SlotState::Active);
        }
    }

    match ctx.bootloader().get_primary(config) {
        Ok(Some(primary)) => {
            if states.get(&primary) == Some(&SlotState::Inactive) {
                states.insert(primary, SlotState::Active);
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("Cannot query bootloader primary: {e:#}"),
    }

    Ok(states)
}

/// Find a slot by name, also accepting the literal `booted`.
pub fn resolve_slot<'a>(ctx: &'a Context, name: &str) -> Result<&'a Slot> {
    if name == "booted" {
        let states = determine_slot_states(ctx)?;
        let booted = states
            .iter()
            .find(|(_, st)| **st == SlotState::Booted)
            .map(|(n, _)| n.clone())
            .context("No booted slot")?;
        return Ok(&ctx.config.slots[&booted]);
    }
    ctx.config
        .slots
        .get(name)
        .ok_or_else(|| UpdateError::Config(format!("unknown slot '{name}'")).into())
}

/// Replenish a slot's boot attempts.
pub fn mark_slot_good(ctx: &Context, name: &str) -> Result<()> {
    let slot = resolve_slot(ctx, name)?;
    ctx.bootloader()
        .mark_good(&ctx.config, slot)
        .map_err(|e| UpdateError::Bootloader(format!("{e:#}")))?;
    tracing::info!("Marked slot '{}' good", slot.name);
    Ok(())
}

/// Disable a slot so the bootloader skips it.
pub fn mark_slot_bad(ctx: &Context, name: &str) -> Result<()> {
    let slot = resolve_slot(ctx, name)?;
    ctx.bootloader()
        .mark_bad(&ctx.config, slot)
        .map_err(|e| UpdateError::Bootloader(format!("{e:#}")))?;
    tracing::info!("Marked slot '{}' bad", slot.name);
    Ok(())
}

/// The distinct slot classes a manifest targets, in manifest order.
fn manifest_classes(manifest: &Manifest) -> Vec<&str> {
    let mut classes: Vec<&str> = Vec::new();
    for f in &manifest.files {
        if !classes.contains(&f.slotclass.as_str()) {
            classes.push(&f.slotclass);
        }
    }
    classes
}

/// Choose the target slot for each class the manifest touches.
///
/// The compatibility contract is checked first. Per class, candidates
/// exclude read-only slots and anything the running system depends on
/// (booted slot and its ancestors); inactive slots are preferred over
/// active ones, ties broken by lowest index. Chosen slots must form a
/// consistent group: a child target's parent chain may not run through a
/// slot of a targeted class other than that class's own target.
pub fn determine_target_install_group<'a>(
    ctx: &'a Context,
    manifest: &Manifest,
    states: &BTreeMap<String, SlotState>,
) -> Result<BTreeMap<String, &'a Slot>> {
    let config = &ctx.config;
    if manifest.update_compatible != config.compatible {
        return Err(UpdateError::IncompatibleManifest {
            manifest: manifest.update_compatible.clone(),
            system: config.compatible.clone(),
        }
        .into());
    }

    let mut group: BTreeMap<String, &Slot> = BTreeMap::new();
    for class in manifest_classes(manifest) {
        let mut candidates: Vec<&Slot> = config
            .slots_of_class(class)
            .into_iter()
            .filter(|s| !s.readonly)
            .filter(|s| states.get(&s.name) != Some(&SlotState::Booted))
            .collect();
        // Inactive before active, then lowest index.
        candidates.sort_by_key(|s| (states.get(&s.name) == Some(&SlotState::Active), s.index));

        let chosen = candidates.into_iter().find(|candidate| {
            config.ancestors(candidate).all(|ancestor| {
                match group.get(ancestor.class.as_str()) {
                    Some(target) => target.name == ancestor.name,
                    None => true,
                }
            })
        });
        match chosen {
            Some(slot) => {
                tracing::debug!("Selected slot '{}' for class '{class}'", slot.name);
                group.insert(class.to_owned(), slot);
            }
            None => {
                return Err(UpdateError::NoTargetSlot(class.to_owned()).into());
            }
        }
    }

    // A class selected early must not contradict a later child's chain.
    for slot in group.values() {
        for ancestor in config.ancestors(slot) {
            if let Some(target) = group.get(ancestor.class.as_str()) {
                if target.name != ancestor.name {
                    return Err(UpdateError::NoTargetSlot(slot.class.clone()).into());
                }
            }
        }
    }

    Ok(group)
}

fn required_sha256<'a>(f: &'a ManifestFile) -> Result<&'a str> {
    f.payload.sha256().ok_or_else(|| {
        UpdateError::Manifest(format!("payload '{}' carries no sha256", f.filename)).into()
    })
}

/// Stream an image byte-for-byte onto the slot's device, padding the
/// remainder with zeros so no prior content survives.
#[context("Writing image to slot '{}'", slot.name)]
fn write_slot_raw(slot: &Slot, source: &Utf8Path, expected: &str) -> Result<()> {
    if slot.device.as_str().starts_with("/dev/") && is_mounted(&slot.device)? {
        anyhow::bail!("device {} is currently mounted", slot.device);
    }
    let payload_len = std::fs::metadata(source).context("Inspecting payload")?.len();
    let mut dev = std::fs::OpenOptions::new()
        .write(true)
        .open(&slot.device)
        .context("Opening slot device")?;
    // A stat length is zero for block devices; seeking to the end yields
    // the capacity for files and block devices alike.
    let capacity = dev
        .seek(SeekFrom::End(0))
        .context("Measuring slot capacity")?;
    if capacity > 0 && payload_len > capacity {
        anyhow::bail!(
            "payload is {payload_len} bytes but slot {} holds only {capacity}",
            slot.name
        );
    }
    dev.seek(SeekFrom::Start(0)).context("Rewinding slot device")?;

    let mut src = std::fs::File::open(source).context("Opening payload")?;
    let (written, digest) = copy_and_digest(&mut src, &mut dev)?;
    if digest != expected {
        return Err(UpdateError::HashMismatch {
            filename: source.file_name().unwrap_or("payload").to_owned(),
            expected: expected.to_owned(),
            actual: digest,
        }
        .into());
    }
    if capacity > written {
        write_zeros(&mut dev, capacity - written)?;
    }
    dev.sync_all().context("Syncing slot device")?;
    tracing::info!("Wrote {written} bytes to slot '{}'", slot.name);
    Ok(())
}

/// Install the payload into `dir` as `destname`: stream into a temporary
/// file, verify the digest, carry over mode bits, then rename into place.
/// An existing file of that name is replaced atomically; nothing else in
/// `dir` is touched.
fn install_file(dir: &Utf8Path, source: &Utf8Path, destname: &str, expected: &str) -> Result<()> {
    let tmp = dir.join(format!("{destname}.tmp"));
    let dest = dir.join(destname);
    let mut src = std::fs::File::open(source).context("Opening payload")?;
    let mut out = std::fs::File::create(&tmp).context("Creating target file")?;
    let (_, digest) = copy_and_digest(&mut src, &mut out)?;
    out.sync_all().context("Syncing target file")?;
    drop(out);
    if digest != expected {
        let _ = std::fs::remove_file(&tmp);
        return Err(UpdateError::HashMismatch {
            filename: destname.to_owned(),
            expected: expected.to_owned(),
            actual: digest,
        }
        .into());
    }
    let perms = std::fs::metadata(source)
        .context("Inspecting payload")?
        .permissions();
    std::fs::set_permissions(&tmp, perms).context("Setting permissions")?;
    if rustix::process::geteuid().is_root() {
        std::os::unix::fs::chown(&tmp, Some(0), Some(0)).context("Setting ownership")?;
    }
    std::fs::rename(&tmp, &dest).context("Renaming into place")?;
    Ok(())
}

/// Mount the slot's filesystem and install the payload as `destname`,
/// replacing any previous file atomically.
#[context("Copying file into slot '{}'", slot.name)]
fn copy_into_slot(
    ctx: &Context,
    slot: &Slot,
    source: &Utf8Path,
    destname: &str,
    expected: &str,
) -> Result<()> {
    let mountpoint = ctx.config.mountprefix.join(&slot.name);
    std::fs::create_dir_all(&mountpoint).context("Creating slot mountpoint")?;
    let guard = mount_device(&slot.device, &mountpoint, Some(&slot.fstype), true)?;

    match install_file(&mountpoint, source, destname, expected) {
        Ok(()) => guard.unmount(),
        Err(e) => {
            // Keep the original failure; unmount problems are secondary.
            if let Err(ue) = guard.unmount() {
                tracing::warn!("Unmount after failed copy also failed: {ue:#}");
            }
            Err(e)
        }
    }
}

/// Write every payload and promote the target group. `contentdir` holds
/// the payload files the manifest references.
fn install_contents(ctx: &Context, contentdir: &Utf8Path, manifest: &Manifest) -> Result<()> {
    let states = determine_slot_states(ctx)?;
    let group = determine_target_install_group(ctx, manifest, &states)?;

    // Verify all payload digests up front so no slot is touched by a
    // transaction that cannot complete.
    for f in &manifest.files {
        let expected = required_sha256(f)?;
        let path = contentdir.join(&f.filename);
        let actual = sha256_hex_file(&path)?;
        if actual != expected {
            return Err(UpdateError::HashMismatch {
                filename: f.filename.clone(),
                expected: expected.to_owned(),
                actual,
            }
            .into());
        }
    }

    for f in &manifest.files {
        let slot = group[f.slotclass.as_str()];
        let expected = required_sha256(f)?;
        let source = contentdir.join(&f.filename);
        match &f.payload {
            PayloadTarget::RawImage { .. } => write_slot_raw(slot, &source, expected)?,
            PayloadTarget::FileCopy { destname, .. } => {
                copy_into_slot(ctx, slot, &source, destname, expected)?
            }
        }
    }

    // All payloads are on disk; only now is boot state touched. Every
    // slot in the group becomes primary before any is marked good, in
    // manifest order; the backend skips slots that are not
    // boot-selectable.
    let promoted: Vec<&Slot> = manifest_classes(manifest)
        .into_iter()
        .map(|class| group[class])
        .collect();
    for slot in &promoted {
        ctx.bootloader()
            .mark_primary(&ctx.config, slot)
            .map_err(|e| UpdateError::Bootloader(format!("{e:#}")))?;
    }
    for slot in &promoted {
        ctx.bootloader()
            .mark_good(&ctx.config, slot)
            .map_err(|e| UpdateError::Bootloader(format!("{e:#}")))?;
        tracing::info!("Slot '{}' promoted", slot.name);
    }

    if let Some(signer) = &manifest.signer {
        tracing::info!("Installed update signed by {signer}");
    }
    Ok(())
}

/// Install a signed bundle file.
#[context("Installing bundle {bundlepath}")]
pub fn do_install_bundle(ctx: &Context, bundlepath: &Utf8Path) -> Result<()> {
    let _lock = InstallLock::acquire(&ctx.config.lockfile)?;
    let signer = verify_bundle(ctx, bundlepath)?;
    let (guard, mountpoint) = mount_bundle(ctx, bundlepath)?;
    let result = (|| -> Result<()> {
        let mut manifest = load_manifest(&mountpoint.join(MANIFEST_NAME))?;
        manifest.signer = Some(signer);
        install_contents(ctx, &mountpoint, &manifest)
    })();
    match result {
        Ok(()) => guard.unmount(),
        Err(e) => {
            if let Err(ue) = guard.unmount() {
                tracing::warn!("Unmount after failed install also failed: {ue:#}");
            }
            Err(e)
        }
    }
}

/// Install from a signed manifest URL: fetch the manifest and its
/// detached signature, verify, then stage every payload locally before
/// writing any slot.
#[context("Installing from {url}")]
pub fn do_install_network(ctx: &Context, url: &str) -> Result<()> {
    let _lock = InstallLock::acquire(&ctx.config.lockfile)?;

    // Nothing interprets the manifest bytes until the signature holds.
    let (raw, sig) = fetch_signed_manifest(url)?;
    let keyring = load_keyring(ctx.keyring_path()?)?;
    let signer = verify_detached(&raw, &sig, &keyring)?;
    tracing::info!("Manifest {url} verified, signed by {signer}");
    let content = std::str::from_utf8(&raw)
        .map_err(|_| UpdateError::Manifest("manifest is not UTF-8".into()))?;
    let mut manifest = Manifest::parse(content)?;
    manifest.signer = Some(signer);

    let base = url
        .rsplit_once('/')
        .map(|(base, _)| base)
        .context("Manifest URL has no path component")?;
    let staging = tempfile::tempdir().context("Creating staging directory")?;
    let stagingdir = Utf8Path::from_path(staging.path()).context("Non-UTF-8 tempdir")?;
    for f in &manifest.files {
        fetch_to(&format!("{base}/{}", f.filename), &stagingdir.join(&f.filename))?;
    }

    install_contents(ctx, stagingdir, &manifest)
}

/// Install from a local bundle path or a URL. URLs ending in `.raucm`
/// name a signed manifest to stream payloads from; anything else is
/// treated as a bundle, fetched first if remote.
pub fn do_install(ctx: &Context, source: &str) -> Result<()> {
    let remote = ["http://", "https://", "file://"]
        .iter()
        .any(|p| source.starts_with(p));
    if remote && source.ends_with(".raucm") {
        return do_install_network(ctx, source);
    }
    if remote {
        let staging = tempfile::tempdir().context("Creating staging directory")?;
        let local = Utf8PathBuf::from_path_buf(staging.path().join("bundle.raucb"))
            .map_err(|_| anyhow::anyhow!("Non-UTF-8 tempdir"))?;
        crate::fetch::fetch_to(source, &local)?;
        return do_install_bundle(ctx, &local);
    }
    do_install_bundle(ctx, Utf8Path::new(source))
}
