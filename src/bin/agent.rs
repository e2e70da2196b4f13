//! ctxterm-agent
//!
//! Runs inside the execution context with its control socket at descriptor 3
//! and serves sessions until the front-end lets go of the channel.

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use tracing::{info, warn, Level};

use ctxterm::agent::{
    daemonize, reset_signal_dispositions, standalone_requested, Daemon, SessionOutcome,
};
use ctxterm::config::Config;
use ctxterm::logging;
use ctxterm::protocol::CONTROL_FD;

/// ctxterm agent
///
/// Serves pty sessions over the control socket at descriptor 3
#[derive(Parser, Debug)]
#[command(name = "ctxterm-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Detach from the starting process (also CTXTERM_AGENT_STANDALONE=1)
    #[arg(long)]
    standalone: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Before logging: no other thread may exist when forking
    if args.standalone || standalone_requested() {
        daemonize().context("Failed to daemonize")?;
    }

    logging::init(args.verbose, Level::INFO);
    info!("ctxterm-agent v{} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());

    reset_signal_dispositions().context("Failed to reset signal dispositions")?;

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
    .context("Failed to load configuration")?;

    // Keep the control socket out of every command the agent spawns
    fcntl(CONTROL_FD, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .context("No control socket at descriptor 3")?;
    // SAFETY: descriptor 3 was installed for this process by the front-end
    // and nothing else in the agent refers to it.
    let control = unsafe { OwnedFd::from_raw_fd(CONTROL_FD) };

    let mut daemon = Daemon::new(control, config.session);
    let reason = daemon.run()?;
    info!("Shutting down ({:?}), {} session(s) served", reason, daemon.accepted());

    for outcome in daemon.wait_sessions() {
        if !matches!(outcome, SessionOutcome::Exited(_)) {
            warn!("Session ended without reporting: {:?}", outcome);
        }
    }
    Ok(())
}
