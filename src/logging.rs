use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

fn filter_directives(verbose: bool) -> String {
    env::var("FORKING_SERVICE_LOG")
        .ok()
        .or_else(|| env::var("RUST_LOG").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Install the global stderr subscriber once. Returns false when a subscriber was already set.
pub fn init_logging(verbose: bool) -> bool {
    if INIT.get().is_some() {
        return false;
    }

    let filter = EnvFilter::try_new(filter_directives(verbose))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("forking-service: logging init skipped (global subscriber already set)");
        return false;
    }

    let _ = INIT.set(());
    true
}
