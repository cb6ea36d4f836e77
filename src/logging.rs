//! Logging setup for binaries embedding the engine.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary, which calls [`init`] once at startup.

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Install a `RUST_LOG`-filtered subscriber. A no-op when `RUST_LOG` is
/// unset or when called again.
pub fn init() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}
