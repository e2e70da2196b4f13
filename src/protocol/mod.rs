//! Agent/session wire protocol
//!
//! Everything that crosses a process boundary goes through this module: the
//! JSON payloads exchanged on a session socket and the datagram transport that
//! carries them together with transferred descriptors.

mod message;
mod transport;

pub use message::*;
pub use transport::*;

use std::os::fd::RawFd;

/// Descriptor slot where the agent finds its end of the control channel
pub const CONTROL_FD: RawFd = 3;

/// Payload of a control datagram; only the attached descriptors carry meaning
pub const CONTROL_PAYLOAD: &[u8] = b" ";
