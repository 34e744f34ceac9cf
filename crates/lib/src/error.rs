//! The stable error taxonomy surfaced to callers and the CLI.
//!
//! Most functions in this crate return `anyhow::Result`; errors that a
//! caller needs to react to programmatically (exit codes, retry policy)
//! are instances of [`UpdateError`] inside the chain and can be recovered
//! via `anyhow::Error::downcast_ref`.

use thiserror::Error;

/// Errors with a stable kind, mapped to CLI exit codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateError {
    /// The system configuration is malformed or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
    /// The manifest failed to parse or violates the schema.
    #[error("manifest error: {0}")]
    Manifest(String),
    /// Signature, trailer or bundle layout verification failed.
    #[error("verification failed: {0}")]
    Verify(String),
    /// A slot class required by the manifest has no eligible slot.
    #[error("no eligible target slot for class '{0}'")]
    NoTargetSlot(String),
    /// The manifest's compatible string does not match the system's.
    #[error("incompatible manifest: update for '{manifest}', system is '{system}'")]
    IncompatibleManifest {
        /// Compatible string declared by the manifest.
        manifest: String,
        /// Compatible string of this system.
        system: String,
    },
    /// A payload's SHA-256 digest does not match the manifest entry.
    #[error("sha256 mismatch for '{filename}': expected {expected}, got {actual}")]
    HashMismatch {
        /// The payload file name from the manifest.
        filename: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest computed from the payload.
        actual: String,
    },
    /// The bootloader backend failed while promoting a slot.
    #[error("bootloader update failed: {0}")]
    Bootloader(String),
    /// Another install invocation holds the system lock.
    #[error("another install is already in progress")]
    Busy,
}

impl UpdateError {
    /// The process exit code for this error kind.
    ///
    /// `0` is success and `2` is reserved for usage errors (produced by
    /// the argument parser, not by this type).
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateError::Verify(_) => 10,
            UpdateError::NoTargetSlot(_) => 11,
            UpdateError::IncompatibleManifest { .. } => 12,
            UpdateError::HashMismatch { .. } => 13,
            UpdateError::Busy => 14,
            UpdateError::Config(_) | UpdateError::Manifest(_) | UpdateError::Bootloader(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(UpdateError::Verify("bad trailer".into()).exit_code(), 10);
        assert_eq!(UpdateError::NoTargetSlot("rootfs".into()).exit_code(), 11);
        assert_eq!(
            UpdateError::IncompatibleManifest {
                manifest: "Other Device".into(),
                system: "Test Config".into()
            }
            .exit_code(),
            12
        );
        assert_eq!(UpdateError::Busy.exit_code(), 14);
        assert_eq!(UpdateError::Config("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let e = anyhow::Error::from(UpdateError::Busy).context("installing");
        let ue = e.downcast_ref::<UpdateError>().unwrap();
        assert_eq!(ue.exit_code(), 14);
    }
}
