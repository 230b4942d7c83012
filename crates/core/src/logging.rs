//! Logging and observability
//!
//! Structured logging for the build pipeline. `RUST_LOG` wins when set;
//! otherwise the default filter keeps the warpgate crates and the
//! `warpgate::build` progress stream at `info` while muting chatty
//! dependencies (hyper, reqwest) behind `warn`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fallback filter when `RUST_LOG` is unset: pipeline crates and build
/// progress at info, everything else warnings only.
const DEFAULT_FILTER: &str = "warn,warpgate=info,warpgate_core=info,warpgate::build=info";

/// Initialize the logging system
pub fn init() -> anyhow::Result<()> {
    init_with_default(DEFAULT_FILTER)
}

/// Initialize with a caller-chosen fallback filter. A second call fails;
/// the subscriber is process-wide.
pub fn init_with_default(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging initialization failed: {e}"))
}
