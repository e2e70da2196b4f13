//! Context entry mechanisms
//!
//! A [`ContextEntry`] turns "run this agent inside that context" into a
//! concrete [`Command`]. The control socket is installed afterwards by the
//! channel establisher, so entries only have to keep descriptor 3 open across
//! whatever wrapper they use.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::unistd::{getuid, User};
use thiserror::Error;
use tracing::debug;

use crate::config::{ContextSettings, EntryKind};

/// Errors that can occur while launching an agent
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to create control channel: {0}")]
    Socket(#[from] Errno),

    #[error("Entry program {program} is not available: {source}")]
    EntryMissing {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Context {context} is unreachable: {reason}")]
    Unreachable { context: String, reason: String },

    #[error("The {entry} entry requires a context name")]
    ContextRequired { entry: String },

    #[error("The {entry} entry cannot enter context {context}")]
    UnsupportedContext { entry: String, context: String },

    #[error("Cannot determine the user to run as")]
    UnknownUser,

    #[error("Failed to spawn agent: {0}")]
    Spawn(#[source] io::Error),
}

/// Result type for launch operations
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Agent program as seen from inside the target context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl AgentCommand {
    /// Create an agent command without extra arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Starts a process inside an execution context
pub trait ContextEntry: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Build the command that runs `agent` inside `context`
    ///
    /// `None` means the local host. The returned command must keep
    /// descriptor 3 open all the way down to the agent.
    fn command(&self, context: Option<&str>, agent: &AgentCommand) -> LaunchResult<Command>;
}

/// Build the entry configured in `settings`
pub fn entry_from_settings(settings: &ContextSettings) -> Box<dyn ContextEntry> {
    match settings.entry {
        EntryKind::Host => Box::new(HostEntry),
        EntryKind::Toolbox => Box::new(ToolboxEntry::new(
            settings.podman.clone(),
            settings.toolbox.clone(),
        )),
    }
}

/// Runs the agent directly on this host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostEntry;

impl ContextEntry for HostEntry {
    fn name(&self) -> &str {
        "host"
    }

    fn command(&self, context: Option<&str>, agent: &AgentCommand) -> LaunchResult<Command> {
        if let Some(context) = context {
            return Err(LaunchError::UnsupportedContext {
                entry: self.name().to_string(),
                context: context.to_string(),
            });
        }

        let mut command = Command::new(&agent.program);
        command.args(&agent.args);
        Ok(command)
    }
}

/// Enters a toolbox container with `podman exec`
///
/// Mirrors what `toolbox run` does: same user, same working directory, the
/// environment toolbox would pass in, and capabilities dropped with `capsh`.
#[derive(Debug, Clone)]
pub struct ToolboxEntry {
    podman: String,
    toolbox: String,
}

impl ToolboxEntry {
    /// Create a toolbox entry using the given executables
    pub fn new(podman: impl Into<String>, toolbox: impl Into<String>) -> Self {
        Self {
            podman: podman.into(),
            toolbox: toolbox.into(),
        }
    }

    /// Start the container if needed and capture the environment toolbox uses
    ///
    /// Returns one `KEY=VALUE` entry per variable.
    fn capture_environment(&self, container: &str) -> LaunchResult<Vec<OsString>> {
        debug!("Capturing environment of container {}", container);

        let output = Command::new(&self.toolbox)
            .args(["run", "--container", container, "env", "-0"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LaunchError::EntryMissing {
                    program: self.toolbox.clone(),
                    source: e,
                },
                _ => LaunchError::Spawn(e),
            })?;

        if !output.status.success() {
            return Err(LaunchError::Unreachable {
                context: container.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_env0(&output.stdout))
    }

    /// Build the `podman exec` invocation
    fn exec_command(
        &self,
        container: &str,
        env: &[OsString],
        user: &str,
        workdir: &Path,
        agent: &AgentCommand,
    ) -> Command {
        let mut command = Command::new(&self.podman);
        command
            .arg("exec")
            .arg("--preserve-fds=1")
            .arg("--user")
            .arg(user)
            .arg("--workdir")
            .arg(workdir);

        for entry in env {
            let mut flag = OsString::from("--env=");
            flag.push(entry);
            command.arg(flag);
        }

        command
            .arg(container)
            .args(["capsh", "--caps=", "--", "-c", "exec \"$@\"", "/bin/bash"])
            .arg(&agent.program)
            .args(&agent.args);
        command
    }
}

impl ContextEntry for ToolboxEntry {
    fn name(&self) -> &str {
        "toolbox"
    }

    fn command(&self, context: Option<&str>, agent: &AgentCommand) -> LaunchResult<Command> {
        let container = context.ok_or_else(|| LaunchError::ContextRequired {
            entry: self.name().to_string(),
        })?;

        let env = self.capture_environment(container)?;
        let user = current_user()?;
        let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));

        Ok(self.exec_command(container, &env, &user, &workdir, agent))
    }
}

fn current_user() -> LaunchResult<String> {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => Ok(user.name),
        _ => std::env::var("USER").map_err(|_| LaunchError::UnknownUser),
    }
}

/// Split `env -0` output into its entries
fn parse_env0(output: &[u8]) -> Vec<OsString> {
    output
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| OsString::from_vec(entry.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| String::from_utf8_lossy(arg.as_bytes()).into_owned())
            .collect()
    }

    #[test]
    fn test_host_entry_runs_agent_directly() {
        let agent = AgentCommand::new("/usr/libexec/ctxterm-agent").arg("--verbose");
        let command = HostEntry.command(None, &agent).unwrap();
        assert_eq!(command.get_program(), OsStr::new("/usr/libexec/ctxterm-agent"));
        assert_eq!(args_of(&command), vec!["--verbose"]);
    }

    #[test]
    fn test_host_entry_rejects_context() {
        let agent = AgentCommand::new("ctxterm-agent");
        let result = HostEntry.command(Some("fedora"), &agent);
        assert!(matches!(
            result,
            Err(LaunchError::UnsupportedContext { .. })
        ));
    }

    #[test]
    fn test_toolbox_entry_requires_context() {
        let entry = ToolboxEntry::new("podman", "toolbox");
        let result = entry.command(None, &AgentCommand::new("ctxterm-agent"));
        assert!(matches!(result, Err(LaunchError::ContextRequired { .. })));
    }

    #[test]
    fn test_toolbox_entry_missing_binary() {
        let entry = ToolboxEntry::new("podman", "/nonexistent/toolbox");
        let result = entry.command(Some("fedora"), &AgentCommand::new("ctxterm-agent"));
        assert!(matches!(result, Err(LaunchError::EntryMissing { .. })));
    }

    #[test]
    fn test_toolbox_entry_unreachable_container() {
        // `false` stands in for a toolbox that cannot start the container
        let entry = ToolboxEntry::new("podman", "false");
        let result = entry.command(Some("missing"), &AgentCommand::new("ctxterm-agent"));
        match result {
            Err(LaunchError::Unreachable { context, .. }) => assert_eq!(context, "missing"),
            other => panic!("Expected Unreachable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_exec_command_layout() {
        let entry = ToolboxEntry::new("podman", "toolbox");
        let env = vec![OsString::from("HOME=/home/me"), OsString::from("LANG=C.UTF-8")];
        let agent = AgentCommand::new("/home/me/.local/bin/ctxterm-agent");
        let command = entry.exec_command("fedora", &env, "me", Path::new("/home/me/src"), &agent);

        assert_eq!(command.get_program(), OsStr::new("podman"));
        assert_eq!(
            args_of(&command),
            vec![
                "exec",
                "--preserve-fds=1",
                "--user",
                "me",
                "--workdir",
                "/home/me/src",
                "--env=HOME=/home/me",
                "--env=LANG=C.UTF-8",
                "fedora",
                "capsh",
                "--caps=",
                "--",
                "-c",
                "exec \"$@\"",
                "/bin/bash",
                "/home/me/.local/bin/ctxterm-agent",
            ]
        );
    }

    #[test]
    fn test_parse_env0() {
        let parsed = parse_env0(b"A=1\0B=two words\0\0");
        assert_eq!(parsed, vec![OsString::from("A=1"), OsString::from("B=two words")]);
        assert!(parse_env0(b"").is_empty());
    }

    #[test]
    fn test_entry_from_settings() {
        let mut settings = ContextSettings::default();
        assert_eq!(entry_from_settings(&settings).name(), "host");
        settings.entry = EntryKind::Toolbox;
        assert_eq!(entry_from_settings(&settings).name(), "toolbox");
    }
}
