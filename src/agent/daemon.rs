//! Agent accept loop
//!
//! Reads control datagrams and starts one handler thread per transferred
//! session socket. The loop holds no per-session state; handlers share only
//! a clone of the session settings.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::socket::MsgFlags;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{SessionHandler, SessionOutcome};
use crate::config::SessionSettings;
use crate::protocol::{recv_datagram, Datagram, MAX_MESSAGE_SIZE};

/// Control payloads are a single sentinel byte; anything larger is junk
const CONTROL_CAPACITY: usize = 64;

/// Errors from the accept loop
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to receive on control channel: {0}")]
    Receive(#[source] Errno),

    #[error("Control datagram carried {0} descriptors, expected one")]
    TooManyDescriptors(usize),

    #[error("Control datagram was truncated")]
    Truncated,

    #[error("Failed to start session thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

impl DaemonError {
    /// Whether the control channel is unusable and the loop must stop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaemonError::Receive(Errno::EBADF | Errno::ENOTSOCK | Errno::EINVAL | Errno::EFAULT)
        )
    }
}

/// Why the accept loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The front-end sent a datagram without descriptors
    Requested,
    /// The front-end closed the control channel
    ChannelClosed,
}

/// What a single control datagram asks for
enum ControlRequest {
    Session(OwnedFd),
    Shutdown(ShutdownReason),
}

/// The agent's accept loop
#[derive(Debug)]
pub struct Daemon {
    control: OwnedFd,
    settings: SessionSettings,
    handlers: Vec<JoinHandle<SessionOutcome>>,
    accepted: u64,
}

impl Daemon {
    /// Create a daemon serving `control`
    pub fn new(control: OwnedFd, settings: SessionSettings) -> Self {
        Self {
            control,
            settings,
            handlers: Vec::new(),
            accepted: 0,
        }
    }

    /// Number of sessions accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Accept sessions until the front-end asks to stop or goes away
    ///
    /// Returning does not affect sessions that are already running; see
    /// [`Daemon::wait_sessions`].
    pub fn run(&mut self) -> Result<ShutdownReason, DaemonError> {
        info!("Agent accepting sessions");
        loop {
            match self.next_request() {
                Ok(ControlRequest::Session(socket)) => {
                    if let Err(e) = self.spawn_handler(socket) {
                        warn!("{}", e);
                    }
                }
                Ok(ControlRequest::Shutdown(reason)) => {
                    info!("Agent stopped accepting sessions: {:?}", reason);
                    return Ok(reason);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("{}", e),
            }
            self.reap_finished();
        }
    }

    /// Block until every session handler has finished
    pub fn wait_sessions(self) -> Vec<SessionOutcome> {
        let count = self.handlers.len();
        if count > 0 {
            info!("Waiting for {} running session(s)", count);
        }
        self.handlers
            .into_iter()
            .filter_map(|handle| handle.join().ok())
            .collect()
    }

    fn next_request(&self) -> Result<ControlRequest, DaemonError> {
        match recv_datagram(self.control.as_fd(), CONTROL_CAPACITY, MsgFlags::empty()) {
            Ok(datagram) => classify(datagram),
            Err(Errno::ECONNRESET) => Ok(ControlRequest::Shutdown(ShutdownReason::ChannelClosed)),
            Err(e) => Err(DaemonError::Receive(e)),
        }
    }

    fn spawn_handler(&mut self, socket: OwnedFd) -> Result<(), DaemonError> {
        self.accepted += 1;
        let handler = SessionHandler::new(socket, self.settings.clone());
        debug!("Accepted session {}", handler.id());

        let handle = thread::Builder::new()
            .name(format!("session-{}", self.accepted))
            .spawn(move || handler.run())
            .map_err(DaemonError::ThreadSpawn)?;
        self.handlers.push(handle);
        Ok(())
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handlers)
            .into_iter()
            .partition(JoinHandle::is_finished);
        self.handlers = running;
        for handle in finished {
            if let Ok(outcome) = handle.join() {
                debug!("Session thread ended: {:?}", outcome);
            }
        }
    }
}

/// Interpret one control datagram
///
/// Descriptors in a rejected datagram are closed when it is dropped.
fn classify(mut datagram: Datagram) -> Result<ControlRequest, DaemonError> {
    if datagram.truncated {
        return Err(DaemonError::Truncated);
    }
    if datagram.is_eof() {
        return Ok(ControlRequest::Shutdown(ShutdownReason::ChannelClosed));
    }
    match datagram.fds.len() {
        0 => Ok(ControlRequest::Shutdown(ShutdownReason::Requested)),
        1 => Ok(ControlRequest::Session(datagram.fds.remove(0))),
        n => Err(DaemonError::TooManyDescriptors(n)),
    }
}

/// Restore default handling of terminal-generated signals
///
/// A shell or container runtime may have started the agent with SIGINT or
/// SIGQUIT ignored, and children would inherit that.
pub fn reset_signal_dispositions() -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGQUIT] {
        // SAFETY: installing SIG_DFL does not run any handler code.
        unsafe { sigaction(signal, &default) }?;
    }
    Ok(())
}
