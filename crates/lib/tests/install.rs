//! End-to-end installs against a file-backed system layout. Payloads are
//! streamed from signed manifests over file:// URLs; no root privileges
//! or block devices are needed.

mod common;

use common::{read_device, System, SLOT_SIZE};

use slotup_lib::bootloader::BootEvent;
use slotup_lib::error::UpdateError;
use slotup_lib::install::{do_install, InstallLock};

#[test]
fn test_install_targets_inactive_partner() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"new rootfs image".repeat(17);
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    do_install(&ctx, &url).unwrap();

    // The partner slot got the image plus zero padding to capacity
    let written = read_device(&sys.device("rootfs1"));
    assert_eq!(written.len() as u64, SLOT_SIZE);
    assert_eq!(&written[..payload.len()], &payload[..]);
    assert!(written[payload.len()..].iter().all(|b| *b == 0));

    // The booted slot was not touched
    assert!(read_device(&sys.device("rootfs0")).iter().all(|b| *b == 0xff));

    // Promotion happened, in order, after the write
    assert_eq!(
        sys.bootloader.recorded(),
        vec![
            BootEvent::MarkPrimary("rootfs.1".into()),
            BootEvent::MarkGood("rootfs.1".into()),
        ]
    );
}

#[test]
fn test_install_group_spans_classes() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let rootfs = b"rootfs payload".repeat(9);
    let appfs = b"appfs payload".repeat(5);
    let url = sys.signed_update(
        &ctx,
        "update-a",
        &[("rootfs", &rootfs), ("appfs", &appfs)],
    );

    do_install(&ctx, &url).unwrap();

    assert_eq!(&read_device(&sys.device("rootfs1"))[..rootfs.len()], &rootfs[..]);
    assert_eq!(&read_device(&sys.device("appfs1"))[..appfs.len()], &appfs[..]);
    // The active group's slots are untouched
    assert!(read_device(&sys.device("appfs0")).iter().all(|b| *b == 0xff));

    // The whole group is promoted, the layered slot included, with
    // every mark_primary ahead of any mark_good
    assert_eq!(
        sys.bootloader.recorded(),
        vec![
            BootEvent::MarkPrimary("rootfs.1".into()),
            BootEvent::MarkPrimary("appfs.1".into()),
            BootEvent::MarkGood("rootfs.1".into()),
            BootEvent::MarkGood("appfs.1".into()),
        ]
    );
}

#[test]
fn test_install_is_idempotent() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"same image twice".repeat(11);
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    do_install(&ctx, &url).unwrap();
    let after_first = read_device(&sys.device("rootfs1"));
    do_install(&ctx, &url).unwrap();
    assert_eq!(read_device(&sys.device("rootfs1")), after_first);

    assert_eq!(
        sys.bootloader.recorded(),
        vec![
            BootEvent::MarkPrimary("rootfs.1".into()),
            BootEvent::MarkGood("rootfs.1".into()),
            BootEvent::MarkPrimary("rootfs.1".into()),
            BootEvent::MarkGood("rootfs.1".into()),
        ]
    );
}

#[test]
fn test_incompatible_manifest_changes_nothing() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let contentdir = sys.base.join("update-x");
    std::fs::create_dir(&contentdir).unwrap();
    std::fs::write(contentdir.join("rootfs.img"), b"payload").unwrap();
    std::fs::write(
        contentdir.join(slotup_lib::manifest::MANIFEST_NAME),
        "[update]\ncompatible=Other Device\n\n[file.rootfs]\nfilename=rootfs.img\n",
    )
    .unwrap();
    slotup_lib::manifest::update_manifest(&ctx, &contentdir, true).unwrap();
    let url = format!(
        "file://{}",
        contentdir.join(slotup_lib::manifest::MANIFEST_NAME)
    );

    let e = do_install(&ctx, &url).unwrap_err();
    assert_eq!(e.downcast_ref::<UpdateError>().unwrap().exit_code(), 12);

    assert!(sys.bootloader.recorded().is_empty());
    assert!(read_device(&sys.device("rootfs1")).iter().all(|b| *b == 0xff));
}

#[test]
fn test_corrupted_payload_aborts_before_any_write() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"good payload".repeat(21);
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    // Corrupt the payload after the manifest was checksummed and signed
    std::fs::write(sys.base.join("update-a/rootfs.img"), b"evil payload").unwrap();

    let e = do_install(&ctx, &url).unwrap_err();
    let ue = e.downcast_ref::<UpdateError>().unwrap();
    assert!(matches!(ue, UpdateError::HashMismatch { .. }));
    assert_eq!(ue.exit_code(), 13);

    // No slot was written and boot state is untouched
    assert!(read_device(&sys.device("rootfs1")).iter().all(|b| *b == 0xff));
    assert!(sys.bootloader.recorded().is_empty());
}

#[test]
fn test_tampered_manifest_rejected() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"payload".repeat(13);
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    // Flip the version after signing
    let mpath = sys.base.join("update-a").join(slotup_lib::manifest::MANIFEST_NAME);
    let text = std::fs::read_to_string(&mpath).unwrap();
    std::fs::write(&mpath, text.replace("version=1.0", "version=6.66")).unwrap();

    let e = do_install(&ctx, &url).unwrap_err();
    assert_eq!(e.downcast_ref::<UpdateError>().unwrap().exit_code(), 10);
    assert!(sys.bootloader.recorded().is_empty());
}

#[test]
fn test_unverified_manifest_is_never_parsed() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"payload".to_vec();
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    // Replace the manifest with bytes that are not even a key file; the
    // now-stale signature must reject them before anything parses them.
    let mpath = sys.base.join("update-a").join(slotup_lib::manifest::MANIFEST_NAME);
    std::fs::write(&mpath, b"\xff\xfe not a manifest [[[").unwrap();

    let e = do_install(&ctx, &url).unwrap_err();
    let ue = e.downcast_ref::<UpdateError>().unwrap();
    assert!(matches!(ue, UpdateError::Verify(_)), "{ue}");
    assert_eq!(ue.exit_code(), 10);
    assert!(sys.bootloader.recorded().is_empty());
}

#[test]
fn test_missing_signature_rejected() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"payload".to_vec();
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);
    std::fs::remove_file(sys.base.join("update-a/manifest.raucm.sig")).unwrap();

    assert!(do_install(&ctx, &url).is_err());
    assert!(sys.bootloader.recorded().is_empty());
}

#[test]
fn test_concurrent_install_is_busy() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let payload = b"payload".to_vec();
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &payload)]);

    let _held = InstallLock::acquire(&ctx.config.lockfile).unwrap();
    let e = do_install(&ctx, &url).unwrap_err();
    assert_eq!(e.downcast_ref::<UpdateError>().unwrap().exit_code(), 14);
}

#[test]
#[ignore = "requires root, mkfs.ext4 and loop devices"]
fn test_file_copy_into_mounted_slot_preserves_neighbors() {
    let sys = System::new();
    let ctx = sys.context("rootfs.0");

    // Grow the appfs.1 backing file to a mountable size and format it
    let dev = sys.device("appfs1");
    std::fs::OpenOptions::new()
        .write(true)
        .open(&dev)
        .unwrap()
        .set_len(8 << 20)
        .unwrap();
    let st = std::process::Command::new("mkfs.ext4")
        .args(["-q", "-F", dev.as_str()])
        .status()
        .unwrap();
    assert!(st.success());

    // A file from an earlier cycle that must survive the install
    {
        let mnt = sys.base.join("premount");
        std::fs::create_dir(&mnt).unwrap();
        let guard = slotup_mount::mount_device(&dev, &mnt, Some("ext4"), true).unwrap();
        std::fs::write(mnt.join("initramfs"), b"previous initramfs").unwrap();
        guard.unmount().unwrap();
    }

    let contentdir = sys.base.join("update-k");
    std::fs::create_dir(&contentdir).unwrap();
    std::fs::write(contentdir.join("vmlinuz-5.img"), b"kernel image").unwrap();
    std::fs::write(
        contentdir.join(slotup_lib::manifest::MANIFEST_NAME),
        "[update]\ncompatible=Test Config\n\n\
         [file.appfs]\nfilename=vmlinuz-5.img\ndestname=vmlinuz\n",
    )
    .unwrap();
    slotup_lib::manifest::update_manifest(&ctx, &contentdir, true).unwrap();
    let url = format!(
        "file://{}",
        contentdir.join(slotup_lib::manifest::MANIFEST_NAME)
    );

    do_install(&ctx, &url).unwrap();

    let mnt = sys.base.join("postmount");
    std::fs::create_dir(&mnt).unwrap();
    let guard = slotup_mount::mount_device(&dev, &mnt, Some("ext4"), false).unwrap();
    assert_eq!(std::fs::read(mnt.join("vmlinuz")).unwrap(), b"kernel image");
    assert_eq!(
        std::fs::read(mnt.join("initramfs")).unwrap(),
        b"previous initramfs"
    );
    assert!(!mnt.join("vmlinuz.tmp").exists());
    guard.unmount().unwrap();
}

#[test]
fn test_second_cycle_targets_previous_slot() {
    // Install from rootfs.0, "reboot" into rootfs.1, install again: the
    // new target must be rootfs.0.
    let sys = System::new();
    let ctx = sys.context("rootfs.0");
    let first = b"first image".repeat(7);
    let url = sys.signed_update(&ctx, "update-a", &[("rootfs", &first)]);
    do_install(&ctx, &url).unwrap();

    let ctx = sys.context("rootfs.1");
    let second = b"second image".repeat(7);
    let url = sys.signed_update(&ctx, "update-b", &[("rootfs", &second)]);
    do_install(&ctx, &url).unwrap();

    assert_eq!(&read_device(&sys.device("rootfs0"))[..second.len()], &second[..]);
    assert_eq!(&read_device(&sys.device("rootfs1"))[..first.len()], &first[..]);
    assert_eq!(
        sys.bootloader.recorded().last(),
        Some(&BootEvent::MarkGood("rootfs.0".into()))
    );
}
