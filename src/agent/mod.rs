//! Agent side of the session protocol
//!
//! The agent runs inside the execution context with its control socket at
//! descriptor 3. It accepts session sockets and serves each one on its own
//! thread: allocate a pty, spawn the command, report how it exited.

mod daemon;
mod daemonize;
mod handler;

pub use daemon::*;
pub use daemonize::*;
pub use handler::*;
