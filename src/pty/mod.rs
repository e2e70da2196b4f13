//! PTY management module
//!
//! Allocates pseudo-terminals and runs session commands on them. Built on raw
//! `posix_openpt` so the master can be handed to another process as a plain
//! descriptor.

mod process;

pub use process::*;
