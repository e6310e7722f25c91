//! Internal diagnostics
//!
//! Harness internals (spawned pids, poll results, kill steps, handler
//! installation) log through `tracing`. Run output never does, it goes to the
//! [`Output`](crate::output::Output) sink.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g. `ISORUN_LOG=isorun=debug`
pub const LOG_ENV: &str = "ISORUN_LOG";

/// Install the stderr subscriber. Safe to call more than once.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}
