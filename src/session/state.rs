//! Session lifecycle types

use std::fmt;
use std::os::fd::OwnedFd;

/// Where a session is in its lifecycle
///
/// `Created → AwaitingPty → Active → Exited | EndOfFile`. The last two are
/// terminal; a session reaches exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket handed to the agent, no command sent yet
    Created,
    /// Command sent, waiting for the pty master
    AwaitingPty,
    /// Pty delivered, command running
    Active,
    /// The agent reported this exit code
    Exited(i32),
    /// The agent closed the session without reporting an exit code
    EndOfFile,
}

impl SessionState {
    /// Whether nothing more can happen in this state
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Exited(_) | SessionState::EndOfFile)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::AwaitingPty => write!(f, "awaiting pty"),
            SessionState::Active => write!(f, "active"),
            SessionState::Exited(code) => write!(f, "exited ({})", code),
            SessionState::EndOfFile => write!(f, "end of file"),
        }
    }
}

/// Notification produced by a session
#[derive(Debug)]
pub enum SessionEvent {
    /// The pty master; the receiver owns it from now on
    PtyReady(OwnedFd),
    /// The command terminated with this code
    Exited(i32),
    /// The session ended without an exit code
    EndOfFile,
}

/// Receives the events of one session
///
/// Each method is called at most once, and exactly one of `on_exited` and
/// `on_end_of_file` is called per session.
pub trait SessionListener {
    /// The pty is ready for display
    fn on_pty_ready(&mut self, master: OwnedFd);

    /// The command terminated with `code`
    fn on_exited(&mut self, code: i32);

    /// The session ended without an exit code
    fn on_end_of_file(&mut self);
}
