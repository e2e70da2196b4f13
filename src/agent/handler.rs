//! Per-session handler
//!
//! Runs on its own thread and owns exactly one session socket, one pty pair
//! and one child process. The sequence is fixed:
//! read the command, hand over the pty master, spawn, supervise, report.

use std::os::fd::{AsFd, OwnedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::MsgFlags;
use nix::unistd::{getuid, User};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::protocol::{
    recv_datagram, send_datagram, AgentMessage, CommandSpec, ProtocolResult, MAX_MESSAGE_SIZE,
};
use crate::pty::{spawn_failure_code, ChildCommand, PtyChild, PtyPair};

/// First argument replaced by the user's pager
pub const PAGER_SENTINEL: &str = "@pager";

/// First argument replaced by the user's editor
pub const EDITOR_SENTINEL: &str = "@editor";

/// How often (in milliseconds) the session socket is checked for hang-up
/// while the child runs
pub const HANGUP_POLL_INTERVAL_MS: u16 = 100;

/// How a session ended, as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The exit code was delivered to the client
    Exited(i32),
    /// The session never got a pty (bad request or allocation failure)
    Aborted,
    /// The client went away; the child group was killed
    PeerGone,
}

/// Serves one session socket
#[derive(Debug)]
pub struct SessionHandler {
    id: Uuid,
    socket: OwnedFd,
    settings: SessionSettings,
}

impl SessionHandler {
    /// Create a handler for a freshly received session socket
    pub fn new(socket: OwnedFd, settings: SessionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            socket,
            settings,
        }
    }

    /// Identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serve the session to completion
    ///
    /// Every descriptor the handler owns is closed when this returns.
    pub fn run(self) -> SessionOutcome {
        let span = info_span!("session", id = %self.id);
        let _enter = span.enter();

        let spec = match self.read_command() {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Rejected session request: {}", e);
                return SessionOutcome::Aborted;
            }
        };

        if spec.wants_shell() {
            debug!("No command requested, starting a shell");
        }
        let CommandSpec {
            args,
            cwd,
            env,
            aux_fds,
        } = spec;
        let argv = resolve_command(args, &self.settings, login_shell(), |key| {
            std::env::var(key).ok()
        });
        debug!("Resolved command: {:?}", argv);

        let PtyPair { master, slave } = match PtyPair::open() {
            Ok(pty) => pty,
            Err(e) => {
                error!("{}", e);
                return SessionOutcome::Aborted;
            }
        };

        if let Err(e) = self.send_pty(master) {
            warn!("Failed to hand over pty: {}", e);
            return SessionOutcome::PeerGone;
        }

        let mut aux_fds = aux_fds.into_iter();
        let mut argv = argv.into_iter();
        let mut command = ChildCommand::new(argv.next().unwrap_or_default());
        command.args = argv.collect();
        command.cwd = cwd;
        command.term = self.settings.term.clone();
        command.env = env;
        command.stdin = aux_fds.next();

        let spawned = command.spawn(slave.as_fd());
        drop(slave);
        drop(aux_fds);

        let code = match spawned {
            Ok(mut child) => {
                info!("Started process {}", child.pid());
                match self.supervise(&mut child) {
                    Ok(code) => code,
                    Err(outcome) => return outcome,
                }
            }
            Err(e) => {
                let code = spawn_failure_code(&e);
                warn!("{} (reporting {})", e, code);
                code
            }
        };

        match self.send_exit(code) {
            Ok(()) => {
                info!("Session finished with code {}", code);
                SessionOutcome::Exited(code)
            }
            Err(e) => {
                warn!("Failed to report exit code {}: {}", code, e);
                SessionOutcome::PeerGone
            }
        }
    }

    fn read_command(&self) -> ProtocolResult<CommandSpec> {
        let datagram = recv_datagram(self.socket.as_fd(), MAX_MESSAGE_SIZE, MsgFlags::empty())?;
        CommandSpec::decode(datagram)
    }

    /// Send the master and close the local copy
    fn send_pty(&self, master: OwnedFd) -> ProtocolResult<()> {
        let payload = AgentMessage::pty_payload()?;
        send_datagram(self.socket.as_fd(), &payload, &[master.as_fd()])?;
        Ok(())
    }

    fn send_exit(&self, code: i32) -> ProtocolResult<()> {
        let payload = AgentMessage::exit_payload(code)?;
        send_datagram(self.socket.as_fd(), &payload, &[])?;
        Ok(())
    }

    /// Wait for the child while watching the session socket for hang-up
    ///
    /// On hang-up the whole process group is killed and reaped.
    fn supervise(&self, child: &mut PtyChild) -> Result<i32, SessionOutcome> {
        loop {
            match child.try_wait() {
                Ok(Some(code)) => return Ok(code),
                Ok(None) => {}
                Err(e) => {
                    error!("{}", e);
                    abandon(child);
                    return Err(SessionOutcome::Aborted);
                }
            }

            if self.peer_hung_up() {
                info!("Client went away, killing process group {}", child.pid());
                abandon(child);
                return Err(SessionOutcome::PeerGone);
            }
        }
    }

    /// Block up to one poll interval; true once the client closed its end
    fn peer_hung_up(&self) -> bool {
        // Hang-up and error are always reported, even with no requested events
        let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::empty())];
        match poll(&mut fds, PollTimeout::from(HANGUP_POLL_INTERVAL_MS)) {
            Ok(0) => false,
            Ok(_) => fds[0]
                .revents()
                .is_some_and(|events| events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)),
            Err(Errno::EINTR) => false,
            Err(e) => {
                warn!("Polling session socket failed: {}", e);
                true
            }
        }
    }
}

fn abandon(child: &mut PtyChild) {
    if let Err(e) = child.kill_group() {
        warn!("Failed to kill process group {}: {}", child.pid(), e);
    }
    match child.wait() {
        Ok(code) => debug!("Reaped abandoned process with code {}", code),
        Err(e) => warn!("Failed to reap abandoned process: {}", e),
    }
}

/// Turn the requested arguments into the argv to execute
///
/// An empty request runs `login_shell`, or the configured fallback shell.
/// A leading pager or editor sentinel is replaced by the user's program,
/// which may itself carry arguments (`PAGER="less -R"`).
pub fn resolve_command<F>(
    args: Vec<String>,
    settings: &SessionSettings,
    login_shell: Option<String>,
    lookup: F,
) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let Some(first) = args.first() else {
        let shell = login_shell
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| settings.fallback_shell.clone());
        return vec![shell];
    };

    let replacement = match first.as_str() {
        PAGER_SENTINEL => non_empty("PAGER").unwrap_or_else(|| settings.pager.clone()),
        EDITOR_SENTINEL => non_empty("VISUAL")
            .or_else(|| non_empty("EDITOR"))
            .unwrap_or_else(|| settings.editor.clone()),
        _ => return args,
    };

    replacement
        .split_whitespace()
        .map(str::to_string)
        .chain(args.into_iter().skip(1))
        .collect()
}

/// Shell from the password database entry of the current user
pub fn login_shell() -> Option<String> {
    let user = User::from_uid(getuid()).ok().flatten()?;
    let shell = user.shell.to_string_lossy().into_owned();
    (!shell.is_empty()).then_some(shell)
}
