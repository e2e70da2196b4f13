//! ctxterm
//!
//! Interactive pty sessions that run inside another execution context (a
//! toolbox container, or the host) than the front-end displaying them.
//!
//! The front-end starts an agent in the context through a [`context::ContextEntry`]
//! and keeps a [`context::ControlChannel`] to it. Every session is a fresh
//! socket pair: one end goes to the agent, which allocates a pty, passes the
//! master back, runs the command on the slave and reports its exit code; the
//! other end is driven by a [`session::SessionProxy`].

pub mod agent;
pub mod config;
pub mod context;
pub mod logging;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod terminal;
