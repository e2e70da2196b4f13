//! ctxterm
//!
//! Runs one interactive command inside an execution context and relays it
//! through the caller's terminal.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{debug, error, info, Level};

use ctxterm::config::{Config, EntryKind};
use ctxterm::context::{entry_from_settings, AgentCommand, ControlChannel};
use ctxterm::logging;
use ctxterm::protocol::CommandSpec;
use ctxterm::session::SessionEvent;
use ctxterm::terminal::Relay;

/// Exit status used when the session ended without reporting one
const EXIT_NO_STATUS: i32 = 255;

/// ctxterm
///
/// Run a command on a pty inside a container or on the host
#[derive(Parser, Debug)]
#[command(name = "ctxterm")]
#[command(version, about, long_about = None)]
struct Args {
    /// Context to enter (the container name for the toolbox entry)
    #[arg(short, long, env = "CTXTERM_CONTEXT")]
    context: Option<String>,

    /// How to enter the context, overriding the config file
    #[arg(long, value_enum)]
    entry: Option<EntryKind>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory of the command
    #[arg(short = 'C', long = "directory")]
    directory: Option<PathBuf>,

    /// Extra environment variable for the command
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Command to run; the login shell when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_env_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", value)),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose, Level::WARN);

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
    .context("Failed to load configuration")?;

    let mut context_settings = config.context.clone();
    if let Some(entry) = args.entry {
        context_settings.entry = entry;
    }
    let context = args.context.clone().or_else(|| context_settings.default.clone());
    let entry = entry_from_settings(&context_settings);

    let mut agent = AgentCommand::new(config.agent.resolve_program()?);
    agent.args.extend(config.agent.args.iter().cloned());
    if args.verbose {
        agent.args.push("--verbose".to_string());
    }

    debug!(
        "Entering {} through {} entry with agent {}",
        context.as_deref().unwrap_or("host"),
        entry.name(),
        agent.program.display()
    );
    let channel = ControlChannel::establish(entry.as_ref(), context.as_deref(), &agent)?;

    let mut spec = CommandSpec::new(args.command);
    if let Some(directory) = args.directory {
        spec = spec.with_cwd(directory);
    }
    for (key, value) in args.env {
        spec = spec.with_env(key, value);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run_session(&channel, spec));
    channel.shutdown();

    // Exit right away: the stdin reader may still be blocked in the runtime
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(EXIT_NO_STATUS);
        }
    }
}

/// Drive one session to completion and return its exit code
async fn run_session(channel: &ControlChannel, spec: CommandSpec) -> anyhow::Result<i32> {
    let mut session = channel.create_session(spec)?;
    info!("Session {} started", session.id());

    let mut relay: Option<Relay> = None;
    loop {
        let event = session.next_event().await?;
        match event {
            Some(SessionEvent::PtyReady(master)) => {
                relay = Some(Relay::start(master).context("Failed to relay the pty")?);
            }
            Some(SessionEvent::Exited(code)) => {
                if let Some(relay) = relay.take() {
                    relay.finish().await;
                }
                info!("Command exited with code {}", code);
                return Ok(code);
            }
            Some(SessionEvent::EndOfFile) | None => {
                if let Some(relay) = relay.take() {
                    relay.finish().await;
                }
                bail!("Session ended without an exit status");
            }
        }
    }
}
