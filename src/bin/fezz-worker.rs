//! Worker process spawned by the fezz-local dispatcher.
//!
//! Speaks the newline-delimited JSON protocol on stdin/stdout and logs to
//! stderr, which the dispatcher forwards at high verbosity.

use fezz_local::harness::{builtin_handlers, DefaultResolver, Harness};
use fezz_local::worker::DEBUG_ENV;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let default_level = if std::env::var_os(DEBUG_ENV).is_some() {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    Harness::new(DefaultResolver::new(builtin_handlers()))
        .run()
        .await
}
