//! Shared fixtures: a throwaway CA and a system layout backed by
//! regular files standing in for slot devices.

use camino::{Utf8Path, Utf8PathBuf};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use slotup_lib::bootloader::{Bootloader, TestBootloader};
use slotup_lib::context::{Context, ContextBuilder};

/// Capacity of each file-backed slot device.
pub const SLOT_SIZE: u64 = 16 * 1024;

fn gen_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn build_cert(
    cn: &str,
    pubkey: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    is_ca: bool,
    serial: u32,
) -> X509 {
    let mut b = X509Builder::new().unwrap();
    b.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    b.set_serial_number(&serial).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let subject = name.build();
    b.set_subject_name(&subject).unwrap();
    b.set_pubkey(pubkey).unwrap();
    b.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    b.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
    if is_ca {
        b.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    }
    match issuer {
        Some((cert, key)) => {
            b.set_issuer_name(cert.subject_name()).unwrap();
            b.sign(key, MessageDigest::sha256()).unwrap();
        }
        None => {
            b.set_issuer_name(&subject).unwrap();
            b.sign(pubkey, MessageDigest::sha256()).unwrap();
        }
    }
    b.build()
}

/// A full test system: config, slot device files, CA and signing keys,
/// recording bootloader.
pub struct System {
    pub _dir: tempfile::TempDir,
    pub base: Utf8PathBuf,
    pub confpath: Utf8PathBuf,
    pub certpath: Utf8PathBuf,
    pub keypath: Utf8PathBuf,
    pub bootloader: TestBootloader,
}

impl System {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let ca_key = gen_key();
        let ca = build_cert("Test CA", &ca_key, None, true, 1);
        let key = gen_key();
        let cert = build_cert("release-1", &key, Some((&ca, &ca_key)), false, 2);
        let capath = base.join("ca.cert.pem");
        let certpath = base.join("release-1.cert.pem");
        let keypath = base.join("release-1.pem");
        std::fs::write(&capath, ca.to_pem().unwrap()).unwrap();
        std::fs::write(&certpath, cert.to_pem().unwrap()).unwrap();
        std::fs::write(&keypath, key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        let devdir = base.join("dev");
        std::fs::create_dir(&devdir).unwrap();
        for name in ["rootfs0", "rootfs1", "appfs0", "appfs1"] {
            let dev = devdir.join(format!("{name}.img"));
            std::fs::write(&dev, vec![0xffu8; SLOT_SIZE as usize]).unwrap();
        }

        let confpath = base.join("system.conf");
        let conf = format!(
            "[system]\n\
             compatible=Test Config\n\
             bootloader=uboot\n\
             mountprefix={base}/mounts\n\
             lockfile={base}/install.lock\n\
             \n\
             [keyring]\n\
             path={capath}\n\
             \n\
             [slot.rootfs.0]\n\
             device={devdir}/rootfs0.img\n\
             bootname=system0\n\
             \n\
             [slot.rootfs.1]\n\
             device={devdir}/rootfs1.img\n\
             bootname=system1\n\
             \n\
             [slot.appfs.0]\n\
             device={devdir}/appfs0.img\n\
             parent=rootfs.0\n\
             \n\
             [slot.appfs.1]\n\
             device={devdir}/appfs1.img\n\
             parent=rootfs.1\n"
        );
        std::fs::write(&confpath, conf).unwrap();

        Self {
            _dir: dir,
            base,
            confpath,
            certpath,
            keypath,
            bootloader: TestBootloader::default(),
        }
    }

    /// Build a context as if the system were booted from `bootslot`.
    pub fn context(&self, bootslot: &str) -> Context {
        ContextBuilder::new(self.confpath.clone())
            .bootslot(bootslot)
            .certpath(self.certpath.clone())
            .keypath(self.keypath.clone())
            .bootloader(Bootloader::Test(self.bootloader.clone()))
            .build()
            .unwrap()
    }

    pub fn device(&self, name: &str) -> Utf8PathBuf {
        self.base.join(format!("dev/{name}.img"))
    }

    /// Write a content directory holding a manifest plus its payloads,
    /// checksummed and signed, and return the manifest's file:// URL.
    pub fn signed_update(
        &self,
        ctx: &Context,
        name: &str,
        payloads: &[(&str, &[u8])],
    ) -> String {
        let contentdir = self.base.join(name);
        std::fs::create_dir(&contentdir).unwrap();
        let mut manifest = String::from("[update]\ncompatible=Test Config\nversion=1.0\n");
        for (class, data) in payloads {
            std::fs::write(contentdir.join(format!("{class}.img")), data).unwrap();
            manifest.push_str(&format!("\n[file.{class}]\nfilename={class}.img\n"));
        }
        std::fs::write(
            contentdir.join(slotup_lib::manifest::MANIFEST_NAME),
            manifest,
        )
        .unwrap();
        slotup_lib::manifest::update_manifest(ctx, &contentdir, true).unwrap();
        format!(
            "file://{}",
            contentdir.join(slotup_lib::manifest::MANIFEST_NAME)
        )
    }
}

/// Contents of a file-backed slot device.
pub fn read_device(path: &Utf8Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}
