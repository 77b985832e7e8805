//! Logging bootstrap for host applications.
//!
//! The library only emits `tracing` events; installing a subscriber is
//! left to the host.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber
///
/// `RUST_LOG` takes precedence over `default_filter` when set.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .with_context(|| format!("invalid log filter '{}'", default_filter))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("a global tracing subscriber is already installed: {}", e))
}
