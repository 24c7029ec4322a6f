//! Logging setup, grounded on the teacher's `main.rs` registry
//! (`fmt` layer + `EnvFilter`). The teacher additionally forwards
//! `tracing` events to connected WebSocket clients through a custom
//! `Layer`; this daemon's WebSocket already carries a purpose-built
//! `OutputEvent`/`ExecutionEvent`/`StateEvent` protocol per session, so
//! a second channel re-deriving log lines from `tracing` macros would
//! duplicate it for no client that needs it -- dropped, noted in
//! `DESIGN.md`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global `tracing` subscriber: structured `fmt` output with
/// thread ids/names, filtered by `RUST_LOG` (default `info,arm2d=debug`).
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true).with_thread_names(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,arm2d=debug")))
        .init();
}
