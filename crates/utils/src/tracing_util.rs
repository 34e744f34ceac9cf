//! Helpers related to tracing, used by the CLI entrypoint.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration; we log to stderr
/// and the level is controlled via `SLOTUP_LOG` (e.g. `SLOTUP_LOG=debug`).
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_env("SLOTUP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
