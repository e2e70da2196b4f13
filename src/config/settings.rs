//! ctxterm settings
//!
//! Loads configuration from `$XDG_CONFIG_HOME/ctxterm/config.toml`. Every
//! section is optional; a missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration directory name
pub const CONFIG_DIR: &str = "ctxterm";
pub const CONFIG_FILE: &str = "config.toml";

/// File name of the agent binary, looked up next to the front-end
pub const AGENT_BINARY: &str = "ctxterm-agent";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How the agent is started inside its execution context
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Run the agent directly on this host
    #[default]
    Host,
    /// Enter a toolbox container through podman
    Toolbox,
}

/// Agent program settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AgentSettings {
    /// Agent executable; defaults to `ctxterm-agent` next to the front-end
    pub program: Option<PathBuf>,
    /// Extra arguments passed to the agent
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentSettings {
    /// Resolve the agent executable path
    pub fn resolve_program(&self) -> std::io::Result<PathBuf> {
        if let Some(program) = &self.program {
            return Ok(program.clone());
        }
        let exe = std::env::current_exe()?;
        Ok(exe.with_file_name(AGENT_BINARY))
    }
}

/// Execution context settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSettings {
    /// Entry mechanism
    #[serde(default)]
    pub entry: EntryKind,
    /// Context used when none is given on the command line
    pub default: Option<String>,
    /// podman executable
    #[serde(default = "default_podman")]
    pub podman: String,
    /// toolbox executable
    #[serde(default = "default_toolbox")]
    pub toolbox: String,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            entry: EntryKind::default(),
            default: None,
            podman: default_podman(),
            toolbox: default_toolbox(),
        }
    }
}

fn default_podman() -> String {
    "podman".to_string()
}

fn default_toolbox() -> String {
    "toolbox".to_string()
}

/// Settings applied by the agent to every session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Value of `TERM` for spawned commands
    #[serde(default = "default_term")]
    pub term: String,
    /// Shell used when the login shell cannot be resolved
    #[serde(default = "default_fallback_shell")]
    pub fallback_shell: String,
    /// Program substituted for the pager sentinel when `$PAGER` is unset
    #[serde(default = "default_pager")]
    pub pager: String,
    /// Program substituted for the editor sentinel when `$VISUAL`/`$EDITOR` are unset
    #[serde(default = "default_editor")]
    pub editor: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            term: default_term(),
            fallback_shell: default_fallback_shell(),
            pager: default_pager(),
            editor: default_editor(),
        }
    }
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_fallback_shell() -> String {
    "/bin/sh".to_string()
}

fn default_pager() -> String {
    "less".to_string()
}

fn default_editor() -> String {
    "vi".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub session: SessionSettings,
}

impl Config {
    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from the default location
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

/// `$XDG_CONFIG_HOME/ctxterm/config.toml`, or `~/.config/ctxterm/config.toml`
pub fn default_path() -> Option<PathBuf> {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(std::env::var_os("HOME")?).join(".config"),
    };
    Some(base.join(CONFIG_DIR).join(CONFIG_FILE))
}
