//! Common logger configuration for remsign binaries.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger.
///
/// + Prints enabled events and spans to stdout.
/// + The default level includes INFO, WARN and ERROR events.
/// + `RUST_LOG` overrides the level or per-module filtering, using the
///   usual `tracing_subscriber` targets syntax.
///
/// Panics if a logger is already initialized; use [`init_for_testing`] in
/// tests, where multiple threads race to install one.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Best-effort logger init for tests; does nothing without `RUST_LOG`.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

pub fn try_init() -> Result<(), TryInitError> {
    let rust_log_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(rust_log_filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
