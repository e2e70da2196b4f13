//! Logging setup shared by both binaries
//!
//! Output always goes to stderr: the front-end's stdout carries the pty
//! relay, and a standalone agent's stdout is `/dev/null`.

use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Pick the default level: `quiet` unless the verbosity flag is set
///
/// The front-end shares its stderr with the user's terminal and passes
/// `WARN`; the agent passes `INFO`.
pub fn default_level(verbose: bool, quiet: Level) -> Level {
    if verbose {
        Level::DEBUG
    } else {
        quiet
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the level picked from `verbose`. Calling this more
/// than once keeps the first subscriber.
pub fn init(verbose: bool, quiet: Level) {
    let level = default_level(verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
