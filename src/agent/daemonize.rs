//! Standalone daemonization
//!
//! Detaches the agent from whatever started it so it survives the entry
//! process. The control socket at descriptor 3 is kept.

use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::{IntoRawFd, RawFd};

use nix::unistd::{close, dup2, fork, setsid, ForkResult};

use crate::protocol::CONTROL_FD;

/// Environment variable that turns on standalone mode
pub const STANDALONE_ENV: &str = "CTXTERM_AGENT_STANDALONE";

/// Highest descriptor closed when `/proc/self/fd` is unavailable
const FALLBACK_MAX_FD: RawFd = 65536;

/// Detach into the background
///
/// Forks (parent exits), points stdio at `/dev/null`, closes every inherited
/// descriptor above the control slot, starts a new session and forks again
/// so the agent can never reacquire a controlling terminal.
///
/// Must run before any other thread is started.
pub fn daemonize() -> io::Result<()> {
    fork_and_exit_parent()?;
    redirect_stdio()?;
    close_inherited_fds();
    setsid()?;
    fork_and_exit_parent()?;
    Ok(())
}

fn fork_and_exit_parent() -> io::Result<()> {
    // SAFETY: the process is still single-threaded, so the child may run
    // arbitrary code after fork.
    match unsafe { fork() }? {
        // SAFETY: _exit skips atexit handlers and stdio flushing, which
        // belong to the child now.
        ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
        ForkResult::Child => Ok(()),
    }
}

fn redirect_stdio() -> io::Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?
        .into_raw_fd();
    for fd in 0..=2 {
        if fd != null {
            dup2(null, fd)?;
        }
    }
    if null > 2 {
        close(null)?;
    }
    Ok(())
}

/// Close every descriptor above the control slot
fn close_inherited_fds() {
    for fd in inherited_fds() {
        let _ = close(fd);
    }
}

fn inherited_fds() -> Vec<RawFd> {
    match fs::read_dir("/proc/self/fd") {
        // Collected before closing, the directory handle is one of them
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
            .filter(|fd| *fd > CONTROL_FD)
            .collect(),
        Err(_) => (CONTROL_FD + 1..FALLBACK_MAX_FD).collect(),
    }
}

/// Whether standalone mode was requested through the environment
pub fn standalone_requested() -> bool {
    std::env::var(STANDALONE_ENV).is_ok_and(|value| matches!(value.as_str(), "1" | "true" | "yes"))
}
