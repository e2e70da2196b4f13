//! PTY process management
//!
//! Handles spawning processes on a pseudo-terminal, including:
//! - Allocating the master/slave pair
//! - Making the slave the child's controlling terminal
//! - Mapping termination to a single exit code
//! - Killing the child's whole process group

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setsid, Pid};
use thiserror::Error;

/// Exit code reported when the program does not exist
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code reported when the program exists but cannot be executed
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// Offset added to the signal number of a signal-terminated child
pub const EXIT_SIGNAL_BASE: i32 = 128;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(#[source] Errno),

    #[error("Failed to open PTY slave: {0}")]
    OpenSlaveFailed(#[source] io::Error),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("Failed to wait for process: {0}")]
    WaitFailed(#[source] io::Error),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(#[source] io::Error),

    #[error("PTY system error: {0}")]
    SystemError(#[from] Errno),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Read the size of the terminal behind `fd`, if it is one
    pub fn of_terminal(fd: BorrowedFd<'_>) -> Option<Self> {
        let mut ws = Self::default().to_winsize();
        // SAFETY: TIOCGWINSZ writes a `winsize` into the pointed-to struct.
        let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if rc < 0 || ws.ws_col == 0 || ws.ws_row == 0 {
            return None;
        }
        Some(Self::new(ws.ws_col, ws.ws_row))
    }

    /// Apply this size to a pty (either side)
    pub fn apply(self, pty: BorrowedFd<'_>) -> PtyResult<()> {
        let ws = self.to_winsize();
        // SAFETY: TIOCSWINSZ only reads the pointed-to struct.
        let rc = unsafe { libc::ioctl(pty.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(PtyError::ResizeFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// A freshly allocated pseudo-terminal
///
/// Both descriptors are close-on-exec; the slave only reaches a child through
/// explicit stdio redirection.
#[derive(Debug)]
pub struct PtyPair {
    /// Display side, handed to the front-end
    pub master: OwnedFd,
    /// Terminal side, becomes the child's controlling terminal
    pub slave: OwnedFd,
}

impl PtyPair {
    /// Allocate a new pty pair
    ///
    /// Both ends are opened with `O_CLOEXEC` so a child forked by another
    /// session thread can never inherit them.
    pub fn open() -> PtyResult<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(PtyError::OpenFailed)?;
        grantpt(&master).map_err(PtyError::OpenFailed)?;
        unlockpt(&master).map_err(PtyError::OpenFailed)?;
        let slave_path = ptsname_r(&master).map_err(PtyError::OpenFailed)?;

        // std opens with O_CLOEXEC
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&slave_path)
            .map_err(PtyError::OpenSlaveFailed)?;

        // SAFETY: the descriptor comes straight from posix_openpt and is
        // owned by nothing else once `master` is consumed.
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        Ok(Self {
            master,
            slave: slave.into(),
        })
    }
}

/// Everything needed to start a command on a pty slave
#[derive(Debug)]
pub struct ChildCommand {
    /// Program to execute, looked up in `PATH` when relative
    pub program: String,
    /// Arguments after the program name
    pub args: Vec<String>,
    /// Working directory; inherited when `None`
    pub cwd: Option<PathBuf>,
    /// Value of `TERM`, applied before `env`
    pub term: String,
    /// Variables layered over the inherited environment
    pub env: BTreeMap<String, String>,
    /// Alternate standard input; the slave is used when `None`
    pub stdin: Option<OwnedFd>,
}

impl ChildCommand {
    /// Create a command with the default terminal type
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            term: "xterm-256color".to_string(),
            env: BTreeMap::new(),
            stdin: None,
        }
    }

    /// Start the command with `slave` as its controlling terminal
    ///
    /// The child leads a new session (and therefore a new process group) and
    /// acquires the slave with `TIOCSCTTY`, so job control and resizing work.
    /// Standard output and error always go to the slave.
    pub fn spawn(self, slave: BorrowedFd<'_>) -> PtyResult<PtyChild> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command.env("TERM", &self.term);
        command.envs(&self.env);

        let stdin = match self.stdin {
            Some(fd) => Stdio::from(fd),
            None => Stdio::from(slave.try_clone_to_owned().map_err(PtyError::SpawnFailed)?),
        };
        let stdout = slave.try_clone_to_owned().map_err(PtyError::SpawnFailed)?;
        let stderr = slave.try_clone_to_owned().map_err(PtyError::SpawnFailed)?;
        command
            .stdin(stdin)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // SAFETY: pre_exec runs after fork() but before exec() in the child
        // process. setsid and ioctl are async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                setsid()?;
                if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(PtyError::SpawnFailed)?;
        // Dropping the command closes the parent's copies of the stdio ends.
        drop(command);

        Ok(PtyChild::new(child))
    }
}

/// A running child that leads its own process group
#[derive(Debug)]
pub struct PtyChild {
    child: Child,
    pgid: Pid,
}

impl PtyChild {
    fn new(child: Child) -> Self {
        let pgid = Pid::from_raw(child.id() as i32);
        Self { child, pgid }
    }

    /// Process ID of the child (also its process group ID)
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Check for termination without blocking
    pub fn try_wait(&mut self) -> PtyResult<Option<i32>> {
        let status = self.child.try_wait().map_err(PtyError::WaitFailed)?;
        Ok(status.map(exit_code))
    }

    /// Block until the child terminates
    pub fn wait(&mut self) -> PtyResult<i32> {
        let status = self.child.wait().map_err(PtyError::WaitFailed)?;
        Ok(exit_code(status))
    }

    /// SIGKILL every process in the child's group
    ///
    /// A group that is already gone is not an error.
    pub fn kill_group(&self) -> PtyResult<()> {
        kill_process_group(self.pgid)
    }
}

/// SIGKILL a process group, ignoring groups that no longer exist
pub fn kill_process_group(pgid: Pid) -> PtyResult<()> {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(PtyError::SystemError(e)),
    }
}

/// Map a termination status to one integer
///
/// Normal exit reports its own code; death by signal `n` reports `128 + n`,
/// the shell convention.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => EXIT_SIGNAL_BASE + signal,
        (None, None) => EXIT_SIGNAL_BASE,
    }
}

/// Exit code reported when the command could not be started at all
pub fn spawn_failure_code(err: &PtyError) -> i32 {
    match err {
        PtyError::SpawnFailed(e) if e.kind() == io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        _ => EXIT_CANNOT_EXECUTE,
    }
}
