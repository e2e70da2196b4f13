//! Control channel to an agent
//!
//! The front-end keeps one end of a seqpacket socket pair; the agent receives
//! the other at descriptor 3. The channel is only used to hand over session
//! sockets and to ask the agent to stop accepting.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Stdio};

use nix::errno::Errno;
use tracing::{debug, info, warn};

use super::entry::{AgentCommand, ContextEntry, LaunchError, LaunchResult};
use crate::protocol::{send_datagram, seqpacket_pair, CommandSpec, CONTROL_FD, CONTROL_PAYLOAD};
use crate::session::{SessionProxy, SessionResult};

/// Front-end side of the connection to one agent
#[derive(Debug)]
pub struct ControlChannel {
    socket: OwnedFd,
    /// Process started by the context entry, reaped when the channel goes away
    agent: Option<Child>,
}

impl ControlChannel {
    /// Start an agent inside `context` and connect to it
    ///
    /// Returns as soon as the process is spawned; the agent's readiness is
    /// only observed through the first session.
    pub fn establish(
        entry: &dyn ContextEntry,
        context: Option<&str>,
        agent: &AgentCommand,
    ) -> LaunchResult<Self> {
        let (ours, theirs) = seqpacket_pair()?;

        let mut command = entry.command(context, agent)?;
        let program = command.get_program().to_string_lossy().into_owned();
        command.stdin(Stdio::null());

        let their_fd = theirs.as_raw_fd();
        // SAFETY: pre_exec runs after fork() but before exec() in the child
        // process. install_control_fd only calls fcntl and dup2.
        unsafe {
            command.pre_exec(move || install_control_fd(their_fd));
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::EntryMissing {
                program: program.clone(),
                source: e,
            },
            _ => LaunchError::Spawn(e),
        })?;
        drop(command);
        drop(theirs);

        info!(
            "Started agent through {} entry (context: {}, pid {})",
            entry.name(),
            context.unwrap_or("host"),
            child.id()
        );

        Ok(Self {
            socket: ours,
            agent: Some(child),
        })
    }

    /// Wrap an already connected control socket
    pub fn from_socket(socket: OwnedFd) -> Self {
        Self {
            socket,
            agent: None,
        }
    }

    /// Hand a session socket end to the agent
    ///
    /// The descriptor is transferred in a single datagram and closed here.
    pub fn request_session(&self, session_end: OwnedFd) -> Result<(), Errno> {
        send_datagram(self.socket.as_fd(), CONTROL_PAYLOAD, &[session_end.as_fd()])
    }

    /// Open a session and send its command
    pub fn create_session(&self, spec: CommandSpec) -> SessionResult<SessionProxy> {
        let mut session = SessionProxy::create(self)?;
        session.start(spec)?;
        Ok(session)
    }

    /// Ask the agent to stop accepting sessions and close the channel
    ///
    /// Sessions that are already running are not affected.
    pub fn shutdown(self) {
        match send_datagram(self.socket.as_fd(), CONTROL_PAYLOAD, &[]) {
            Ok(()) => debug!("Sent shutdown to agent"),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => debug!("Agent already gone"),
            Err(e) => warn!("Failed to send shutdown to agent: {}", e),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(mut child) = self.agent.take() {
            // The agent exits once the socket closes, right after this returns
            std::thread::spawn(move || match child.wait() {
                Ok(status) => debug!("Agent process exited: {}", status),
                Err(e) => warn!("Failed to reap agent process: {}", e),
            });
        }
    }
}

/// Put `fd` at the control slot in a freshly forked child
fn install_control_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain descriptor syscalls on descriptors owned by this process.
    unsafe {
        if fd == CONTROL_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(fd, CONTROL_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
