//! Command-line frontend.

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::bundle::{create_bundle, mount_bundle, verify_bundle};
use crate::context::{Context, ContextBuilder};
use crate::error::UpdateError;
use crate::install::{do_install, mark_slot_bad, mark_slot_good};
use crate::manifest::{load_manifest, update_manifest, MANIFEST_NAME};
use crate::status::{format_status, slot_status};

/// Global options shared by every subcommand.
#[derive(Debug, Parser)]
pub struct GlobalOpts {
    /// Path to the system configuration
    #[clap(long, global = true, default_value = "/etc/slotup/system.conf")]
    pub conf: Utf8PathBuf,

    /// CA bundle overriding the configured verification keyring
    #[clap(long, global = true)]
    pub keyring: Option<Utf8PathBuf>,

    /// Signing certificate (bundle creation and manifest signing)
    #[clap(long, global = true)]
    pub cert: Option<Utf8PathBuf>,

    /// Signing key (bundle creation and manifest signing)
    #[clap(long, global = true)]
    pub key: Option<Utf8PathBuf>,

    /// Override the mount prefix from the configuration
    #[clap(long, global = true)]
    pub mount_prefix: Option<Utf8PathBuf>,

    /// Skip boot-slot detection and assume this slot is booted
    #[clap(long, global = true)]
    pub override_boot_slot: Option<String>,
}

impl GlobalOpts {
    fn context(&self) -> Result<Context> {
        let mut b = ContextBuilder::new(self.conf.clone());
        if let Some(p) = &self.keyring {
            b = b.capath(p.clone());
        }
        if let Some(p) = &self.cert {
            b = b.certpath(p.clone());
        }
        if let Some(p) = &self.key {
            b = b.keypath(p.clone());
        }
        if let Some(p) = &self.mount_prefix {
            b = b.mountprefix(p.clone());
        }
        if let Some(s) = &self.override_boot_slot {
            b = b.bootslot(s.clone());
        }
        b.build()
    }
}

/// The subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum Opt {
    /// Install an update from a bundle file or URL
    Install {
        /// Bundle path, bundle URL, or URL of a signed manifest
        source: String,
    },
    /// Create a signed bundle from a content directory
    Bundle {
        /// Directory holding manifest.raucm and the payloads
        contentdir: Utf8PathBuf,
        /// Output bundle path
        output: Utf8PathBuf,
    },
    /// Recompute payload checksums in a content directory's manifest
    UpdateManifest {
        /// Directory holding manifest.raucm and the payloads
        contentdir: Utf8PathBuf,
        /// Also write a detached signature next to the manifest
        #[clap(long)]
        sign: bool,
    },
    /// Verify a bundle and show its manifest
    Info {
        /// Bundle path
        bundle: Utf8PathBuf,
    },
    /// Show the slot inventory and its state
    Status {
        /// Machine-readable output
        #[clap(long)]
        json: bool,
    },
    /// Replenish a slot's boot attempts
    MarkGood {
        /// Slot name, or "booted"
        slot: String,
    },
    /// Disable a slot so the bootloader skips it
    MarkBad {
        /// Slot name, or "booted"
        slot: String,
    },
}

/// Top-level parsed arguments.
#[derive(Debug, Parser)]
#[clap(name = "slotup", version, about = "A/B system updater")]
pub struct Cli {
    #[clap(flatten)]
    pub global: GlobalOpts,

    #[clap(subcommand)]
    pub opt: Opt,
}

fn run(cli: Cli) -> Result<()> {
    let ctx = cli.global.context()?;
    match cli.opt {
        Opt::Install { source } => do_install(&ctx, &source),
        Opt::Bundle { contentdir, output } => {
            update_manifest(&ctx, &contentdir, false)?;
            create_bundle(&ctx, &output, &contentdir)
        }
        Opt::UpdateManifest { contentdir, sign } => update_manifest(&ctx, &contentdir, sign),
        Opt::Info { bundle } => {
            let signer = verify_bundle(&ctx, &bundle)?;
            println!("Signed by: {signer}");
            let (guard, mountpoint) = mount_bundle(&ctx, &bundle)?;
            let r = (|| -> Result<()> {
                let manifest = load_manifest(&mountpoint.join(MANIFEST_NAME))?;
                println!("Compatible: {}", manifest.update_compatible);
                if let Some(v) = &manifest.update_version {
                    println!("Version: {v}");
                }
                for f in &manifest.files {
                    println!(
                        "  [{}] {} ({})",
                        f.slotclass,
                        f.filename,
                        f.payload.sha256().unwrap_or("no checksum")
                    );
                }
                Ok(())
            })();
            guard.unmount()?;
            r
        }
        Opt::Status { json } => {
            let rows = slot_status(&ctx)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                let identity = ctx.bootname().get_bootname()?;
                print!("{}", format_status(&rows, &identity));
            }
            Ok(())
        }
        Opt::MarkGood { slot } => mark_slot_good(&ctx, &slot),
        Opt::MarkBad { slot } => mark_slot_bad(&ctx, &slot),
    }
}

/// Parse arguments, run, and map failures to process exit codes.
pub fn main() -> i32 {
    // Usage errors print and exit 2 via clap.
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            match e.downcast_ref::<UpdateError>() {
                Some(ue) => ue.exit_code(),
                None => 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["slotup", "install", "/updates/bundle.raucb"]);
        assert!(matches!(cli.opt, Opt::Install { source } if source == "/updates/bundle.raucb"));
        assert_eq!(cli.global.conf, "/etc/slotup/system.conf");

        let cli = Cli::parse_from([
            "slotup",
            "--conf",
            "/tmp/system.conf",
            "--override-boot-slot",
            "rootfs.0",
            "status",
            "--json",
        ]);
        assert!(matches!(cli.opt, Opt::Status { json: true }));
        assert_eq!(cli.global.conf, "/tmp/system.conf");
        assert_eq!(cli.global.override_boot_slot.as_deref(), Some("rootfs.0"));
    }

    #[test]
    fn test_cli_rejects_unknown() {
        assert!(Cli::try_parse_from(["slotup", "frobnicate"]).is_err());
        assert!(Cli::try_parse_from(["slotup"]).is_err());
    }

    #[test]
    fn test_mark_subcommands() {
        let cli = Cli::parse_from(["slotup", "mark-good", "booted"]);
        assert!(matches!(cli.opt, Opt::MarkGood { slot } if slot == "booted"));
        let cli = Cli::parse_from(["slotup", "mark-bad", "rootfs.1"]);
        assert!(matches!(cli.opt, Opt::MarkBad { slot } if slot == "rootfs.1"));
    }
}
