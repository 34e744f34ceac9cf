//! Detached PKCS#7/CMS signatures over manifests and bundle payloads,
//! verified against a CA-anchored keyring.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509Ref, X509};

use crate::error::UpdateError;

/// The verified identity of a signer: the subject name of the leaf
/// certificate that produced the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity(pub String);

impl std::fmt::Display for SignerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn subject_string(cert: &X509Ref) -> String {
    let mut out = String::new();
    for entry in cert.subject_name().entries() {
        if !out.is_empty() {
            out.push_str(", ");
        }
        let key = entry
            .object()
            .nid()
            .short_name()
            .unwrap_or("UNKNOWN");
        out.push_str(key);
        out.push('=');
        match entry.data().as_utf8() {
            Ok(s) => out.push_str(&s),
            Err(_) => out.push_str("<non-utf8>"),
        }
    }
    out
}

/// Load the CA bundle anchoring verification.
#[context("Loading keyring {capath}")]
pub fn load_keyring(capath: &Utf8Path) -> Result<X509Store> {
    let pem = std::fs::read(capath).context("Reading CA bundle")?;
    let certs = X509::stack_from_pem(&pem).context("Parsing CA bundle")?;
    anyhow::ensure!(!certs.is_empty(), "CA bundle contains no certificates");
    let mut builder = X509StoreBuilder::new()?;
    for cert in certs {
        builder.add_cert(cert)?;
    }
    Ok(builder.build())
}

/// Produce a detached PKCS#7 signature (DER) over `data`.
#[context("Signing with {certpath}")]
pub fn sign_detached(data: &[u8], certpath: &Utf8Path, keypath: &Utf8Path) -> Result<Vec<u8>> {
    let cert = X509::from_pem(&std::fs::read(certpath).context("Reading certificate")?)
        .context("Parsing certificate")?;
    let key = PKey::private_key_from_pem(&std::fs::read(keypath).context("Reading key")?)
        .context("Parsing private key")?;
    let extra = Stack::new()?;
    let p7 = Pkcs7::sign(
        &cert,
        &key,
        &extra,
        data,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )
    .context("Creating signature")?;
    Ok(p7.to_der().context("Encoding signature")?)
}

/// Verify a detached signature over `data` against the keyring; on
/// success returns the signer identity.
pub fn verify_detached(
    data: &[u8],
    signature: &[u8],
    keyring: &X509Store,
) -> Result<SignerIdentity> {
    let p7 = Pkcs7::from_der(signature)
        .map_err(|e| UpdateError::Verify(format!("cannot parse signature: {e}")))?;
    let extra = Stack::new()?;
    p7.verify(&extra, keyring, Some(data), None, Pkcs7Flags::BINARY)
        .map_err(|e| UpdateError::Verify(format!("signature rejected: {e}")))?;
    let signers = p7
        .signers(&extra, Pkcs7Flags::empty())
        .map_err(|e| UpdateError::Verify(format!("cannot extract signer: {e}")))?;
    let signer = signers
        .get(0)
        .ok_or_else(|| UpdateError::Verify("signature carries no signer certificate".into()))?;
    Ok(SignerIdentity(subject_string(signer)))
}
