//! The process-wide context: configuration plus the selected boot-name
//! provider and bootloader backend, constructed once and immutable for
//! the rest of the invocation.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::bootloader::Bootloader;
use crate::bootname::BootnameProvider;
use crate::config::{BootloaderKind, SystemConfig};
use crate::error::UpdateError;

/// Immutable per-invocation state. All configuration mutation happens in
/// [`ContextBuilder`] before this is constructed.
#[derive(Debug)]
pub struct Context {
    /// The loaded and validated system configuration.
    pub config: SystemConfig,
    /// Certificate used when signing manifests and bundles.
    pub certpath: Option<Utf8PathBuf>,
    /// Private key used when signing manifests and bundles.
    pub keypath: Option<Utf8PathBuf>,
    capath: Option<Utf8PathBuf>,
    bootname: BootnameProvider,
    bootloader: Bootloader,
}

impl Context {
    /// The CA bundle anchoring verification: the `--keyring` override, or
    /// the `[keyring]` path from the configuration.
    pub fn keyring_path(&self) -> Result<&Utf8Path> {
        self.capath
            .as_deref()
            .or(self.config.keyring.as_deref())
            .ok_or_else(|| UpdateError::Config("no keyring configured".into()).into())
    }

    /// The boot-name provider for this system.
    pub fn bootname(&self) -> &BootnameProvider {
        &self.bootname
    }

    /// The bootloader backend for this system.
    pub fn bootloader(&self) -> &Bootloader {
        &self.bootloader
    }
}

/// Collects configuration before freezing it into a [`Context`].
#[derive(Debug, Default)]
pub struct ContextBuilder {
    configpath: Utf8PathBuf,
    certpath: Option<Utf8PathBuf>,
    keypath: Option<Utf8PathBuf>,
    capath: Option<Utf8PathBuf>,
    mountprefix: Option<Utf8PathBuf>,
    bootslot: Option<String>,
    bootloader: Option<Bootloader>,
}

impl ContextBuilder {
    /// Start from a `system.conf` path.
    pub fn new(configpath: impl Into<Utf8PathBuf>) -> Self {
        Self {
            configpath: configpath.into(),
            ..Default::default()
        }
    }

    /// Signing certificate path.
    pub fn certpath(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.certpath = Some(path.into());
        self
    }

    /// Signing key path.
    pub fn keypath(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.keypath = Some(path.into());
        self
    }

    /// Verification keyring (CA bundle) path, overriding the config.
    pub fn capath(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.capath = Some(path.into());
        self
    }

    /// Mount prefix override.
    pub fn mountprefix(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.mountprefix = Some(path.into());
        self
    }

    /// Boot slot override: skip cmdline detection and use this identity.
    pub fn bootslot(mut self, name: impl Into<String>) -> Self {
        self.bootslot = Some(name.into());
        self
    }

    /// Replace the bootloader backend; used by tests to install the
    /// recording stub.
    pub fn bootloader(mut self, bootloader: Bootloader) -> Self {
        self.bootloader = Some(bootloader);
        self
    }

    /// Load the configuration and freeze the context.
    pub fn build(self) -> Result<Context> {
        let mut config = SystemConfig::load(&self.configpath)?;
        if let Some(prefix) = self.mountprefix {
            config.mountprefix = prefix;
        }
        let bootname = match self.bootslot {
            Some(name) => BootnameProvider::Fixed(name),
            None => BootnameProvider::Cmdline,
        };
        let bootloader = self.bootloader.unwrap_or(match config.bootloader {
            BootloaderKind::Barebox => Bootloader::Barebox,
            BootloaderKind::Uboot => Bootloader::Uboot,
            BootloaderKind::Grub => Bootloader::Grub,
        });
        Ok(Context {
            config,
            certpath: self.certpath,
            keypath: self.keypath,
            capath: self.capath,
            bootname,
            bootloader,
        })
    }
}
