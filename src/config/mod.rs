//! Configuration module
//!
//! Loads front-end and agent settings from a TOML file.

mod settings;

pub use settings::*;
