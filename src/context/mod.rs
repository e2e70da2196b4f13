//! Execution contexts
//!
//! Starting an agent inside a context (a container, or the host) and keeping
//! the control channel to it.

mod channel;
mod entry;

pub use channel::*;
pub use entry::*;
