//! Tracing subscriber setup.
//!
//! Components only emit `tracing` events; the host decides where they go.
//! `RUST_LOG`, when set, overrides the configured level.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber at `level` (trace, debug, info, warn, error).
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when several tests initialise logging in the same process.
pub fn init_tracing(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
