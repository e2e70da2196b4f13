//! Session message definitions
//!
//! A session socket carries exactly three kinds of message:
//! 1. client → agent: a JSON [`CommandSpec`], auxiliary descriptors attached
//! 2. agent → client: the JSON string `"pty"` with the pty master attached
//! 3. agent → client: the JSON integer exit code, followed by close
//!
//! There is no envelope; the kind is recovered from the decoded shape.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Datagram;

/// Payload of the pty-ready message
pub const PTY_TAG: &str = "pty";

/// Maximum number of arguments in a command
pub const MAX_ARGS: usize = 4096;

/// Maximum path length for the working directory
pub const MAX_PATH_LENGTH: usize = 4096;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unrecognized message: {0}")]
    UnrecognizedShape(String),

    #[error("Expected {expected} descriptor(s), received {received}")]
    Descriptors { expected: usize, received: usize },

    #[error("Message truncated")]
    Truncated,

    #[error("Peer closed the socket")]
    Closed,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] Errno),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Description of the command a session should run
///
/// `aux_fds` never appear in the JSON payload; they are attached to the same
/// datagram as transferred descriptors.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program and arguments; empty means the user's login shell
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, inherited from the agent when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Variables layered over the agent's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Descriptors for the child's alternate stdio; the first becomes stdin
    #[serde(skip)]
    pub aux_fds: Vec<OwnedFd>,
}

/// Accepted shapes of the first session message
#[derive(Deserialize)]
#[serde(untagged)]
enum RequestShape {
    Argv(Vec<String>),
    Spec(CommandSpec),
    Empty(()),
}

impl CommandSpec {
    /// Create a spec running `args`
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Create a spec running the user's login shell
    pub fn shell() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add or replace an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach an auxiliary descriptor
    pub fn with_aux_fd(mut self, fd: OwnedFd) -> Self {
        self.aux_fds.push(fd);
        self
    }

    /// Whether the default shell should be substituted
    pub fn wants_shell(&self) -> bool {
        self.args.is_empty()
    }

    /// Validate the spec contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.args.len() > MAX_ARGS {
            return Err(ProtocolError::Validation(format!(
                "command exceeds maximum of {} arguments",
                MAX_ARGS
            )));
        }
        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(ProtocolError::Validation(
                "arguments cannot contain NUL bytes".to_string(),
            ));
        }

        if let Some(cwd) = &self.cwd {
            if cwd.as_os_str().is_empty() {
                return Err(ProtocolError::Validation(
                    "cwd cannot be empty when specified".to_string(),
                ));
            }
            if cwd.as_os_str().len() > MAX_PATH_LENGTH {
                return Err(ProtocolError::Validation(format!(
                    "cwd exceeds maximum length of {} characters",
                    MAX_PATH_LENGTH
                )));
            }
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ProtocolError::Validation(format!(
                    "invalid environment variable name {:?}",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(ProtocolError::Validation(format!(
                    "environment variable {} contains a NUL byte",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Serialize the JSON payload (descriptors are sent separately)
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate the first message of a session
    ///
    /// A bare array of strings and `null` are accepted as well as the object
    /// form; anything else is a protocol violation.
    pub fn decode(datagram: Datagram) -> ProtocolResult<Self> {
        if datagram.truncated {
            return Err(ProtocolError::Truncated);
        }
        if datagram.is_eof() {
            return Err(ProtocolError::Closed);
        }

        let mut spec = match serde_json::from_slice::<RequestShape>(&datagram.payload)? {
            RequestShape::Argv(args) => Self::new(args),
            RequestShape::Spec(spec) => spec,
            RequestShape::Empty(()) => Self::shell(),
        };
        spec.validate()?;
        spec.aux_fds = datagram.fds;
        Ok(spec)
    }
}

// ============================================================================
// Agent Messages
// ============================================================================

/// Messages sent from the agent back to the session's client
#[derive(Debug)]
pub enum AgentMessage {
    /// The pty master; ownership passes to the receiver
    PtyReady(OwnedFd),
    /// The command terminated with this code; nothing follows
    Exited(i32),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplyShape {
    Code(i32),
    Tag(String),
}

impl AgentMessage {
    /// Payload of the pty-ready message
    pub fn pty_payload() -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(PTY_TAG)?)
    }

    /// Payload of the exit message
    pub fn exit_payload(code: i32) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(&code)?)
    }

    /// Decode a message received from the agent
    ///
    /// Descriptors that do not belong to the decoded message are closed.
    pub fn decode(datagram: Datagram) -> ProtocolResult<Self> {
        if datagram.truncated {
            return Err(ProtocolError::Truncated);
        }
        if datagram.is_eof() {
            return Err(ProtocolError::Closed);
        }

        let Datagram { payload, fds, .. } = datagram;
        match serde_json::from_slice::<ReplyShape>(&payload)? {
            ReplyShape::Tag(tag) if tag == PTY_TAG => {
                let received = fds.len();
                match <[OwnedFd; 1]>::try_from(fds) {
                    Ok([master]) => Ok(AgentMessage::PtyReady(master)),
                    Err(_) => Err(ProtocolError::Descriptors {
                        expected: 1,
                        received,
                    }),
                }
            }
            ReplyShape::Tag(tag) => Err(ProtocolError::UnrecognizedShape(format!(
                "unknown tag {:?}",
                tag
            ))),
            ReplyShape::Code(_) if !fds.is_empty() => Err(ProtocolError::Descriptors {
                expected: 0,
                received: fds.len(),
            }),
            ReplyShape::Code(code) => Ok(AgentMessage::Exited(code)),
        }
    }
}
