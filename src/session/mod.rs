//! Front-end session handling
//!
//! Drives one agent session asynchronously: hand the socket to the agent,
//! send the command, then report the pty and the exit code as they arrive.

mod proxy;
mod state;

pub use proxy::*;
pub use state::*;
