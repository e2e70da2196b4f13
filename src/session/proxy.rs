//! Front-end side of a session
//!
//! A [`SessionProxy`] owns one end of a session socket pair; the other end is
//! handed to the agent over the control channel. The proxy sends the command
//! once, then turns the agent's replies into [`SessionEvent`]s.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::socket::MsgFlags;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{SessionEvent, SessionListener, SessionState};
use crate::context::ControlChannel;
use crate::protocol::{
    recv_datagram, send_datagram, seqpacket_pair, AgentMessage, CommandSpec, Datagram,
    ProtocolError, MAX_MESSAGE_SIZE,
};

/// Errors that can occur while driving a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session has not been started")]
    NotStarted,

    #[error("Session was already started")]
    AlreadyStarted,

    #[error("Session transport error: {0}")]
    Transport(#[from] Errno),

    #[error("Session I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// One session as seen by the front-end
#[derive(Debug)]
pub struct SessionProxy {
    id: Uuid,
    /// Dropped (and deregistered) once a terminal event is delivered
    socket: Option<AsyncFd<OwnedFd>>,
    state: SessionState,
}

impl SessionProxy {
    /// Open a new session on `channel`
    ///
    /// Must be called from within a tokio runtime; the kept socket end is
    /// registered with its reactor.
    pub fn create(channel: &ControlChannel) -> SessionResult<Self> {
        let (ours, theirs) = seqpacket_pair()?;
        channel.request_session(theirs)?;

        let id = Uuid::new_v4();
        debug!("Session {} created", id);
        Ok(Self {
            id,
            socket: Some(AsyncFd::new(ours)?),
            state: SessionState::Created,
        })
    }

    /// Identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send the command to run
    ///
    /// Auxiliary descriptors in `spec` are transferred and then closed here.
    /// A vanished agent is not an error at this point: the session still
    /// advances and reports `EndOfFile` next.
    pub fn start(&mut self, spec: CommandSpec) -> SessionResult<()> {
        if self.state != SessionState::Created {
            return Err(SessionError::AlreadyStarted);
        }
        spec.validate()?;
        let payload = spec.encode()?;
        let fds: Vec<BorrowedFd<'_>> = spec.aux_fds.iter().map(AsFd::as_fd).collect();

        if let Some(socket) = &self.socket {
            match send_datagram(socket.get_ref().as_fd(), &payload, &fds) {
                Ok(()) => debug!("Session {} started: {:?}", self.id, spec.args),
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    warn!("Session {}: agent closed the session before start", self.id);
                }
                Err(e) => return Err(SessionError::Transport(e)),
            }
        }

        self.state = SessionState::AwaitingPty;
        Ok(())
    }

    /// Wait for the next event
    ///
    /// Returns `Ok(None)` once a terminal event has been delivered.
    pub async fn next_event(&mut self) -> SessionResult<Option<SessionEvent>> {
        match self.state {
            SessionState::Created => return Err(SessionError::NotStarted),
            state if state.is_terminal() => return Ok(None),
            _ => {}
        }

        let received = match &self.socket {
            Some(socket) => receive(socket).await,
            None => Ok(Datagram::default()),
        };

        let event = match received {
            Ok(datagram) if datagram.is_eof() => SessionEvent::EndOfFile,
            Ok(datagram) => self.interpret(datagram),
            Err(e) => {
                warn!("Session {}: receive failed: {}", self.id, e);
                SessionEvent::EndOfFile
            }
        };

        match &event {
            SessionEvent::PtyReady(_) => self.state = SessionState::Active,
            SessionEvent::Exited(code) => self.finish(SessionState::Exited(*code)),
            SessionEvent::EndOfFile => self.finish(SessionState::EndOfFile),
        }
        Ok(Some(event))
    }

    /// Deliver every event of the session to `listener`
    pub async fn run<L: SessionListener>(&mut self, listener: &mut L) -> SessionResult<()> {
        while let Some(event) = self.next_event().await? {
            match event {
                SessionEvent::PtyReady(master) => listener.on_pty_ready(master),
                SessionEvent::Exited(code) => listener.on_exited(code),
                SessionEvent::EndOfFile => listener.on_end_of_file(),
            }
        }
        Ok(())
    }

    /// Abandon the session
    ///
    /// The agent notices the closed socket and kills the command.
    pub fn close(self) {
        debug!("Session {} closed in state {}", self.id, self.state);
    }

    fn interpret(&self, datagram: Datagram) -> SessionEvent {
        match AgentMessage::decode(datagram) {
            Ok(AgentMessage::PtyReady(master)) if self.state == SessionState::AwaitingPty => {
                SessionEvent::PtyReady(master)
            }
            Ok(AgentMessage::PtyReady(_)) => {
                warn!("Session {}: duplicate pty from agent", self.id);
                SessionEvent::EndOfFile
            }
            Ok(AgentMessage::Exited(code)) => SessionEvent::Exited(code),
            Err(e) => {
                warn!("Session {}: malformed reply from agent: {}", self.id, e);
                SessionEvent::EndOfFile
            }
        }
    }

    fn finish(&mut self, state: SessionState) {
        debug!("Session {} finished: {}", self.id, state);
        self.state = state;
        self.socket = None;
    }
}

/// Receive one datagram once the socket becomes readable
async fn receive(socket: &AsyncFd<OwnedFd>) -> io::Result<Datagram> {
    loop {
        let mut guard = socket.readable().await?;
        let result = guard.try_io(|inner| {
            recv_datagram(inner.get_ref().as_fd(), MAX_MESSAGE_SIZE, MsgFlags::MSG_DONTWAIT)
                .map_err(io::Error::from)
        });
        match result {
            Ok(Err(e)) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                return Ok(Datagram::default());
            }
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CONTROL_PAYLOAD, PTY_TAG};

    /// A control channel plus the agent's end of it
    fn channel() -> (ControlChannel, OwnedFd) {
        let (front, agent) = seqpacket_pair().unwrap();
        (ControlChannel::from_socket(front), agent)
    }

    /// Accept the session socket the proxy handed over
    fn accept(agent: &OwnedFd) -> OwnedFd {
        let mut datagram =
            recv_datagram(agent.as_fd(), MAX_MESSAGE_SIZE, MsgFlags::empty()).unwrap();
        assert_eq!(datagram.payload, CONTROL_PAYLOAD);
        assert_eq!(datagram.fds.len(), 1);
        datagram.fds.remove(0)
    }

    /// Consume the command so closing the peer is a clean hang-up
    fn read_command(peer: &OwnedFd) -> CommandSpec {
        let datagram = recv_datagram(peer.as_fd(), MAX_MESSAGE_SIZE, MsgFlags::empty()).unwrap();
        CommandSpec::decode(datagram).unwrap()
    }

    #[tokio::test]
    async fn test_next_event_before_start() {
        let (channel, _agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        assert_eq!(session.state(), SessionState::Created);
        assert!(matches!(
            session.next_event().await,
            Err(SessionError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let _peer = accept(&agent);
        session.start(CommandSpec::new(["true"])).unwrap();
        assert!(matches!(
            session.start(CommandSpec::new(["true"])),
            Err(SessionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_start_sends_command() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let peer = accept(&agent);

        let aux: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        session
            .start(CommandSpec::new(["cat"]).with_env("A", "1").with_aux_fd(aux))
            .unwrap();
        assert_eq!(session.state(), SessionState::AwaitingPty);

        let spec = read_command(&peer);
        assert_eq!(spec.aux_fds.len(), 1);
        assert_eq!(spec.args, vec!["cat"]);
        assert_eq!(spec.env["A"], "1");
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let peer = accept(&agent);
        session.start(CommandSpec::shell()).unwrap();
        assert!(read_command(&peer).wants_shell());

        let master: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        let tag = serde_json::to_vec(PTY_TAG).unwrap();
        send_datagram(peer.as_fd(), &tag, &[master.as_fd()]).unwrap();
        send_datagram(peer.as_fd(), b"7", &[]).unwrap();
        drop(peer);

        assert!(matches!(
            session.next_event().await.unwrap(),
            Some(SessionEvent::PtyReady(_))
        ));
        assert_eq!(session.state(), SessionState::Active);
        assert!(matches!(
            session.next_event().await.unwrap(),
            Some(SessionEvent::Exited(7))
        ));
        assert_eq!(session.state(), SessionState::Exited(7));
        assert!(session.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_without_exit() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let peer = accept(&agent);
        session.start(CommandSpec::shell()).unwrap();
        read_command(&peer);
        drop(peer);

        assert!(matches!(
            session.next_event().await.unwrap(),
            Some(SessionEvent::EndOfFile)
        ));
        assert!(session.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_reply_is_end_of_file() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let peer = accept(&agent);
        session.start(CommandSpec::shell()).unwrap();
        send_datagram(peer.as_fd(), b"\"tty\"", &[]).unwrap();

        assert!(matches!(
            session.next_event().await.unwrap(),
            Some(SessionEvent::EndOfFile)
        ));
        assert_eq!(session.state(), SessionState::EndOfFile);
    }

    #[tokio::test]
    async fn test_start_after_agent_gone() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        drop(accept(&agent));

        session.start(CommandSpec::new(["true"])).unwrap();
        assert!(matches!(
            session.next_event().await.unwrap(),
            Some(SessionEvent::EndOfFile)
        ));
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl SessionListener for Recorder {
        fn on_pty_ready(&mut self, _master: OwnedFd) {
            self.events.push("pty".to_string());
        }

        fn on_exited(&mut self, code: i32) {
            self.events.push(format!("exited {}", code));
        }

        fn on_end_of_file(&mut self) {
            self.events.push("eof".to_string());
        }
    }

    #[tokio::test]
    async fn test_run_notifies_listener() {
        let (channel, agent) = channel();
        let mut session = SessionProxy::create(&channel).unwrap();
        let peer = accept(&agent);
        session.start(CommandSpec::shell()).unwrap();

        let master: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        send_datagram(peer.as_fd(), b"\"pty\"", &[master.as_fd()]).unwrap();
        send_datagram(peer.as_fd(), b"0", &[]).unwrap();

        let mut recorder = Recorder::default();
        session.run(&mut recorder).await.unwrap();
        assert_eq!(recorder.events, vec!["pty", "exited 0"]);
    }
}
