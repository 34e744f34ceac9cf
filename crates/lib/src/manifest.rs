//! The typed update description: compatibility, version and the payload
//! files bound to slot classes.
//!
//! The on-disk form is sectioned key-value text. `[update]` carries the
//! compatibility contract; each `[file.<slotclass>]` section describes
//! one payload. Serialization is canonical so that signing and checksums
//! are reproducible.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::context::Context as UpdateContext;
use crate::digest::sha256_hex_file;
use crate::error::UpdateError;
use crate::keyfile::{KeyFile, Section};
use crate::signature::{sign_detached, SignerIdentity};

/// Manifest file name inside a bundle or content directory.
pub const MANIFEST_NAME: &str = "manifest.raucm";
/// Detached signature sibling suffix.
pub const SIG_SUFFIX: &str = ".sig";

/// How a payload lands in its target slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadTarget {
    /// Streamed byte-for-byte onto the slot's block device.
    RawImage {
        /// Digest of the payload; filled by `update_manifest`.
        sha256: Option<String>,
    },
    /// Copied as `destname` into the slot's mounted filesystem.
    FileCopy {
        /// File name on the target filesystem.
        destname: String,
        /// Digest of the payload; filled by `update_manifest`.
        sha256: Option<String>,
    },
}

impl PayloadTarget {
    /// The recorded payload digest, if any.
    pub fn sha256(&self) -> Option<&str> {
        match self {
            PayloadTarget::RawImage { sha256 } => sha256.as_deref(),
            PayloadTarget::FileCopy { sha256, .. } => sha256.as_deref(),
        }
    }

    fn set_sha256(&mut self, digest: String) {
        match self {
            PayloadTarget::RawImage { sha256 } => *sha256 = Some(digest),
            PayloadTarget::FileCopy { sha256, .. } => *sha256 = Some(digest),
        }
    }
}

/// One payload entry of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    /// Slot class this payload targets.
    pub slotclass: String,
    /// Payload name relative to the content root.
    pub filename: String,
    /// Raw image or in-filesystem file copy.
    pub payload: PayloadTarget,
}

/// A parsed update manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Must equal the system's `compatible` for the install to proceed.
    pub update_compatible: String,
    /// Opaque version string.
    pub update_version: Option<String>,
    /// Payloads, in file order. Install processes them in this order.
    pub files: Vec<ManifestFile>,
    /// Resolved signer identity; present only after verification.
    pub signer: Option<SignerIdentity>,
}

impl Manifest {
    /// Parse manifest text. Unknown top-level sections reject the
    /// manifest; unknown keys within known sections are ignored for
    /// forward compatibility.
    pub fn parse(content: &str) -> Result<Self> {
        let kf = KeyFile::parse(content).map_err(|e| UpdateError::Manifest(format!("{e:#}")))?;

        let mut update_compatible = None;
        let mut update_version = None;
        let mut files = Vec::new();

        for section in &kf.sections {
            match section.name.as_str() {
                "update" => {
                    update_compatible = section.get("compatible").map(str::to_owned);
                    update_version = section.get("version").map(str::to_owned);
                }
                name => {
                    let Some(slotclass) = name.strip_prefix("file.") else {
                        return Err(
                            UpdateError::Manifest(format!("unknown section [{name}]")).into()
                        );
                    };
                    if slotclass.is_empty() {
                        return Err(UpdateError::Manifest("empty slot class".into()).into());
                    }
                    let filename = section
                        .get("filename")
                        .ok_or_else(|| {
                            UpdateError::Manifest(format!("[{name}] is missing 'filename'"))
                        })?
                        .to_owned();
                    let sha256 = section.get("sha256").map(str::to_owned);
                    let payload = match section.get("destname") {
                        Some(destname) => PayloadTarget::FileCopy {
                            destname: destname.to_owned(),
                            sha256,
                        },
                        None => PayloadTarget::RawImage { sha256 },
                    };
                    files.push(ManifestFile {
                        slotclass: slotclass.to_owned(),
                        filename,
                        payload,
                    });
                }
            }
        }

        let update_compatible = update_compatible.ok_or_else(|| {
            UpdateError::Manifest("missing 'compatible' in [update]".into())
        })?;
        Ok(Self {
            update_compatible,
            update_version,
            files,
            signer: None,
        })
    }

    /// Canonical serialization. Key order is fixed, so
    /// `Manifest::parse(m.to_canonical_string())` round-trips and equal
    /// manifests produce identical bytes.
    pub fn to_canonical_string(&self) -> String {
        let mut kf = KeyFile::default();
        let mut update = Section::new("update");
        update.push("compatible", self.update_compatible.as_str());
        if let Some(v) = &self.update_version {
            update.push("version", v.as_str());
        }
        kf.sections.push(update);
        for f in &self.files {
            let mut s = Section::new(format!("file.{}", f.slotclass));
            s.push("filename", f.filename.as_str());
            match &f.payload {
                PayloadTarget::RawImage { sha256 } => {
                    if let Some(d) = sha256 {
                        s.push("sha256", d.as_str());
                    }
                }
                PayloadTarget::FileCopy { destname, sha256 } => {
                    s.push("destname", destname.as_str());
                    if let Some(d) = sha256 {
                        s.push("sha256", d.as_str());
                    }
                }
            }
            kf.sections.push(s);
        }
        kf.to_string()
    }
}

/// Load a manifest from a file.
#[context("Loading manifest {path}")]
pub fn load_manifest(path: &Utf8Path) -> Result<Manifest> {
    let content = std::fs::read_to_string(path).context("Reading manifest")?;
    Manifest::parse(&content)
}

/// Write a manifest in canonical form.
#[context("Saving manifest {path}")]
pub fn save_manifest(path: &Utf8Path, manifest: &Manifest) -> Result<()> {
    std::fs::write(path, manifest.to_canonical_string()).context("Writing manifest")?;
    Ok(())
}

/// Recompute every payload checksum in `contentdir`'s manifest and write
/// it back; with `signed`, also produce the detached signature
/// `manifest.raucm.sig` next to it.
#[context("Updating manifest in {contentdir}")]
pub fn update_manifest(ctx: &UpdateContext, contentdir: &Utf8Path, signed: bool) -> Result<()> {
    let manifest_path = contentdir.join(MANIFEST_NAME);
    let mut manifest = load_manifest(&manifest_path)?;
    for f in &mut manifest.files {
        let digest = sha256_hex_file(&contentdir.join(&f.filename))?;
        f.payload.set_sha256(digest);
    }
    save_manifest(&manifest_path, &manifest)?;
    if signed {
        let (certpath, keypath) = match (&ctx.certpath, &ctx.keypath) {
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(
                    UpdateError::Config("signing requires --cert and --key".into()).into(),
                )
            }
        };
        let sig = sign_detached(manifest.to_canonical_string().as_bytes(), certpath, keypath)?;
        let sigpath = contentdir.join(format!("{MANIFEST_NAME}{SIG_SUFFIX}"));
        std::fs::write(&sigpath, sig).context("Writing signature")?;
        tracing::debug!("Wrote detached signature {sigpath}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    const CANONICAL: &str = indoc! { "
        [update]
        compatible=Test Config
        version=2011.03-2

        [file.rootfs]
        filename=rootfs.img
        sha256=b5bb9d8014a0f9b1d61e21e796d78dccdf1352f23cd32812f4850b878ae4944c

        [file.rootfs]
        filename=vmlinuz-1
        destname=vmlinuz
        sha256=7d865e959b2466918c9863afca942d0fb89d7c9ac0c99bafc3749504ded97730
    " };

    #[test]
    fn test_parse() {
        let m = Manifest::parse(CANONICAL).unwrap();
        assert_eq!(m.update_compatible, "Test Config");
        assert_eq!(m.update_version.as_deref(), Some("2011.03-2"));
        assert_eq!(m.files.len(), 2);
        assert!(matches!(m.files[0].payload, PayloadTarget::RawImage { .. }));
        match &m.files[1].payload {
            PayloadTarget::FileCopy { destname, sha256 } => {
                assert_eq!(destname, "vmlinuz");
                assert!(sha256.is_some());
            }
            other => panic!("expected file copy, got {other:?}"),
        }
        assert!(m.signer.is_none());
    }

    #[test]
    fn test_canonical_round_trip() {
        // Byte-for-byte stability of canonical manifests
        let m = Manifest::parse(CANONICAL).unwrap();
        assert_eq!(m.to_canonical_string(), CANONICAL);
        let again = Manifest::parse(&m.to_canonical_string()).unwrap();
        assert_eq!(again, m);
    }

    #[test]
    fn test_unknown_section_rejected() {
        let e = Manifest::parse("[update]\ncompatible=X\n\n[handler]\nname=x\n").unwrap_err();
        let ue = e.downcast_ref::<UpdateError>().unwrap();
        assert!(matches!(ue, UpdateError::Manifest(_)));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let m = Manifest::parse(
            "[update]\ncompatible=X\nfuture-key=whatever\n\n[file.rootfs]\nfilename=a\nfuture=1\n",
        )
        .unwrap();
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].payload.sha256(), None);
    }

    #[test]
    fn test_requires_compatible() {
        assert!(Manifest::parse("[update]\nversion=1\n").is_err());
    }

    #[test]
    fn test_update_manifest_fills_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let contentdir = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(contentdir.join("rootfs.img"), b"hello\n").unwrap();
        std::fs::write(
            contentdir.join(MANIFEST_NAME),
            "[update]\ncompatible=Test Config\n\n[file.rootfs]\nfilename=rootfs.img\n",
        )
        .unwrap();

        let confpath = contentdir.join("system.conf");
        std::fs::write(&confpath, crate::config::tests::TEST_CONFIG).unwrap();
        let ctx = crate::context::ContextBuilder::new(confpath).build().unwrap();

        update_manifest(&ctx, contentdir, false).unwrap();
        let m = load_manifest(&contentdir.join(MANIFEST_NAME)).unwrap();
        assert_eq!(
            m.files[0].payload.sha256().unwrap(),
            // sha256 of "hello\n"
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_update_manifest_signed_requires_keys() {
        let dir = tempfile::tempdir().unwrap();
        let contentdir = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(contentdir.join(MANIFEST_NAME), "[update]\ncompatible=X\n").unwrap();
        let confpath = contentdir.join("system.conf");
        std::fs::write(&confpath, crate::config::tests::TEST_CONFIG).unwrap();
        let ctx = crate::context::ContextBuilder::new(confpath).build().unwrap();
        let e = update_manifest(&ctx, contentdir, true).unwrap_err();
        assert!(matches!(
            e.downcast_ref::<UpdateError>(),
            Some(UpdateError::Config(_))
        ));
    }
}
