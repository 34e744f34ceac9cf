//! SHA-256 helpers. Hashing is streamed alongside I/O so payloads are
//! read exactly once and mismatches surface at the earliest point.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::sha::Sha256;

const BUFSIZE: usize = 64 * 1024;

/// Compute the SHA-256 of a file, as lowercase hex.
#[context("Hashing {path}")]
pub fn sha256_hex_file(path: &Utf8Path) -> Result<String> {
    let mut f = std::fs::File::open(path).context("Opening file")?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUFSIZE];
    loop {
        let n = f.read(&mut buf).context("Reading file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finish()))
}

/// Single-pass copy: stream `reader` into `writer`, hashing as we go.
/// Returns the number of bytes copied and the SHA-256 hex digest.
pub fn copy_and_digest(reader: &mut impl Read, writer: &mut impl Write) -> Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUFSIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf).context("Reading payload")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).context("Writing payload")?;
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finish())))
}

/// Write `count` zero bytes, used to pad raw slot writes out to the slot
/// size so stale data from a previous image cannot survive past the
/// payload.
pub fn write_zeros(writer: &mut impl Write, mut count: u64) -> Result<()> {
    let zeros = [0u8; BUFSIZE];
    while count > 0 {
        let n = count.min(BUFSIZE as u64) as usize;
        writer.write_all(&zeros[..n]).context("Writing padding")?;
        count -= n as u64;
    }
    Ok(())
}
