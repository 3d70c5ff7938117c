//! Optional logging setup behind the `logging` feature.
//!
//! The library itself only emits `tracing` events; embedding applications
//! usually install their own subscriber. This module offers a ready-made
//! one for binaries that don't: compact output to stderr, level filtered
//! by `RUST_LOG` (default `info`), routed through the progress-bar layer
//! so bars and log lines don't clobber each other.

use std::sync::Once;

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

/// Installs the global subscriber. Safe to call more than once; only the
/// first call has any effect.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let indicatif = IndicatifLayer::new();

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
            .with(indicatif)
            .init();
    });
}
