//! Retrieval of manifests and payloads over `http(s)://` and `file://`.
//!
//! HTTP fetches retry transient transport errors with a short backoff;
//! HTTP error statuses and local filesystem errors are not retried.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::manifest::SIG_SUFFIX;

/// Backoff between retries of a failed transfer.
const RETRY_DELAYS: &[Duration] = &[
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .build()
}

fn http_get(url: &str) -> Result<Vec<u8>> {
    let agent = agent();
    let mut last = None;
    for (attempt, delay) in std::iter::once(&Duration::ZERO)
        .chain(RETRY_DELAYS.iter())
        .enumerate()
    {
        if !delay.is_zero() {
            tracing::debug!("Retrying {url} (attempt {})", attempt + 1);
            std::thread::sleep(*delay);
        }
        match agent.get(url).call() {
            Ok(resp) => {
                let mut buf = Vec::new();
                resp.into_reader()
                    .read_to_end(&mut buf)
                    .context("Reading response body")?;
                return Ok(buf);
            }
            // Server gave a definitive answer; retrying will not help.
            Err(ureq::Error::Status(code, _)) => {
                anyhow::bail!("server returned status {code} for {url}");
            }
            Err(e @ ureq::Error::Transport(_)) => {
                tracing::warn!("Transfer of {url} failed: {e}");
                last = Some(e);
            }
        }
    }
    Err(anyhow::Error::new(last.expect("at least one attempt"))
        .context(format!("Fetching {url} after retries")))
}

fn file_url_path(url: &str) -> Option<&Utf8Path> {
    url.strip_prefix("file://").map(Utf8Path::new)
}

/// Fetch a URL fully into memory. Supports `http(s)://` and `file://`.
#[context("Fetching {url}")]
pub fn fetch_bytes(url: &str) -> Result<Vec<u8>> {
    if let Some(path) = file_url_path(url) {
        return std::fs::read(path).with_context(|| format!("Reading {path}"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return http_get(url);
    }
    anyhow::bail!("unsupported URL scheme in {url}");
}

/// Fetch a URL into a local file, streaming for the HTTP case.
#[context("Fetching {url} to {dest}")]
pub fn fetch_to(url: &str, dest: &Utf8Path) -> Result<()> {
    if let Some(path) = file_url_path(url) {
        std::fs::copy(path, dest).with_context(|| format!("Copying {path}"))?;
        return Ok(());
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("unsupported URL scheme in {url}");
    }
    let agent = agent();
    let mut last: Option<anyhow::Error> = None;
    for (attempt, delay) in std::iter::once(&Duration::ZERO)
        .chain(RETRY_DELAYS.iter())
        .enumerate()
    {
        if !delay.is_zero() {
            tracing::debug!("Retrying {url} (attempt {})", attempt + 1);
            std::thread::sleep(*delay);
        }
        match agent.get(url).call() {
            Ok(resp) => {
                let mut out = std::fs::File::create(dest).context("Creating target file")?;
                std::io::copy(&mut resp.into_reader(), &mut out)
                    .context("Writing response body")?;
                return Ok(());
            }
            Err(ureq::Error::Status(code, _)) => {
                anyhow::bail!("server returned status {code} for {url}");
            }
            Err(e @ ureq::Error::Transport(_)) => {
                tracing::warn!("Transfer of {url} failed: {e}");
                last = Some(e.into());
            }
        }
    }
    Err(last.expect("at least one attempt"))
}

/// Fetch a manifest and its detached signature (`<url>.sig`) as raw
/// bytes. Nothing here interprets the manifest; the caller verifies the
/// signature over these exact bytes before parsing.
#[context("Fetching signed manifest {url}")]
pub fn fetch_signed_manifest(url: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let manifest_bytes = fetch_bytes(url)?;
    let sig_bytes = fetch_bytes(&format!("{url}{SIG_SUFFIX}"))?;
    Ok((manifest_bytes, sig_bytes))
}
