//! Logging setup. Logs go to stderr, stdout carries the CNI result.

use std::sync::OnceLock;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub const DEFAULT_LOG_LEVEL: &str = "info";

static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Installs the global subscriber, filtered by `RUST_LOG` or `info`.
///
/// Calling it again is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    let (filter, handle) = reload::Layer::new(filter);
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .is_ok()
    {
        let _ = FILTER.set(handle);
    }
}

/// Raises the level to `debug` for the rest of the invocation.
pub fn set_debug() {
    if let Some(handle) = FILTER.get() {
        if let Err(e) = handle.reload(EnvFilter::new("debug")) {
            warn!(error = %e, "failed to switch to debug logging");
        }
    }
}
