//! `tracing` initialization: a single entry point driven by `RUST_LOG`
//! (or a `verbose` flag), matching the teacher's `init_logging_with_options`
//! shape without the platform-diagnostics scaffolding this crate has no
//! use for.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
