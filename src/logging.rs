//! Tracing subscriber setup.
//!
//! Log level is controlled via `RUST_LOG` (e.g. `RUST_LOG=ragserve=debug`);
//! defaults to `info` when unset.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}
