//! Front-end terminal relay
//!
//! Copies bytes between the caller's terminal and a pty master, keeps the
//! pty size in step with the caller's window, and holds the caller's
//! terminal in raw mode for the duration.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pty::TerminalSize;

/// How long to keep draining output after the command exited
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const BUFFER_SIZE: usize = 4096;

/// Terminal end-of-file character (^D)
const EOF_CHAR: u8 = 0x04;

/// Raw mode on a terminal, restored on drop
#[derive(Debug)]
pub struct RawMode {
    fd: OwnedFd,
    original: Termios,
}

impl RawMode {
    /// Switch `fd` to raw mode; `None` when it is not a terminal
    pub fn enable(fd: BorrowedFd<'_>) -> io::Result<Option<Self>> {
        let original = match tcgetattr(fd) {
            Ok(termios) => termios,
            Err(nix::errno::Errno::ENOTTY) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(fd, SetArg::TCSANOW, &raw)?;

        Ok(Some(Self {
            fd: fd.try_clone_to_owned()?,
            original,
        }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(self.fd.as_fd(), SetArg::TCSANOW, &self.original) {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Pty master registered with the reactor
pub type AsyncMaster = Arc<AsyncFd<File>>;

/// Put a pty master in non-blocking mode and register it
pub fn register_master(master: OwnedFd) -> io::Result<AsyncMaster> {
    let flags = OFlag::from_bits_truncate(fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(Arc::new(AsyncFd::new(File::from(master))?))
}

/// Copy everything the command prints to `output`
///
/// Ends when every slave descriptor is closed (the master reports `EIO`).
pub async fn pump_output<W>(master: AsyncMaster, mut output: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let read = {
            let mut guard = master.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut buffer)
            }) {
                Ok(read) => read,
                Err(_would_block) => continue,
            }
        };
        match read {
            Ok(0) => return Ok(()),
            Ok(n) => {
                output.write_all(&buffer[..n]).await?;
                output.flush().await?;
            }
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Copy `input` to the command until `input` ends
///
/// The end of `input` is forwarded as the terminal's EOF character.
pub async fn pump_input<R>(mut input: R, master: AsyncMaster) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];
    loop {
        let n = input.read(&mut buffer).await?;
        if n == 0 {
            return write_master(&master, &[EOF_CHAR]).await;
        }
        write_master(&master, &buffer[..n]).await?;
    }
}

async fn write_master(master: &AsyncFd<File>, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = master.writable().await?;
        let written = guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.write(data)
        });
        match written {
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Follow the caller's window size onto the pty
async fn follow_window_size(master: AsyncMaster) -> io::Result<()> {
    let mut resized = signal(SignalKind::window_change())?;
    while resized.recv().await.is_some() {
        if let Some(size) = TerminalSize::of_terminal(io::stdin().as_fd()) {
            debug!("Window resized to {}x{}", size.cols, size.rows);
            if let Err(e) = size.apply(master.get_ref().as_fd()) {
                warn!("{}", e);
            }
        }
    }
    Ok(())
}

/// Relay between this process's stdio and a session's pty
#[derive(Debug)]
pub struct Relay {
    output: JoinHandle<io::Result<()>>,
    input: JoinHandle<io::Result<()>>,
    resize: JoinHandle<io::Result<()>>,
    raw_mode: Option<RawMode>,
}

impl Relay {
    /// Start relaying; must be called from within a tokio runtime
    ///
    /// The pty takes the caller's terminal size, and the caller's terminal
    /// is put in raw mode until the relay finishes.
    pub fn start(master: OwnedFd) -> io::Result<Self> {
        let size = TerminalSize::of_terminal(io::stdin().as_fd()).unwrap_or_default();
        if let Err(e) = size.apply(master.as_fd()) {
            warn!("{}", e);
        }

        let master = register_master(master)?;
        let raw_mode = RawMode::enable(io::stdin().as_fd())?;

        Ok(Self {
            output: tokio::spawn(pump_output(master.clone(), tokio::io::stdout())),
            input: tokio::spawn(pump_input(tokio::io::stdin(), master.clone())),
            resize: tokio::spawn(follow_window_size(master)),
            raw_mode,
        })
    }

    /// Drain the remaining output and restore the terminal
    pub async fn finish(self) {
        self.input.abort();
        self.resize.abort();

        match tokio::time::timeout(DRAIN_TIMEOUT, self.output).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("Output relay ended: {}", e),
            Ok(Err(e)) => debug!("Output relay task failed: {}", e),
            Err(_) => debug!("Output still open after the command exited"),
        }
        drop(self.raw_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtyPair;

    #[test]
    fn test_raw_mode_restores() {
        let pty = PtyPair::open().unwrap();
        let before = tcgetattr(pty.slave.as_fd()).unwrap();

        let raw = RawMode::enable(pty.slave.as_fd()).unwrap().unwrap();
        let during = tcgetattr(pty.slave.as_fd()).unwrap();
        assert_ne!(during.local_flags, before.local_flags);

        drop(raw);
        let after = tcgetattr(pty.slave.as_fd()).unwrap();
        assert_eq!(after.local_flags, before.local_flags);
    }

    #[test]
    fn test_raw_mode_skips_non_terminal() {
        let file = File::open("/dev/null").unwrap();
        assert!(RawMode::enable(file.as_fd()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pump_output_until_hangup() {
        let pty = PtyPair::open().unwrap();
        let mut slave = File::from(pty.slave);
        slave.write_all(b"hello\n").unwrap();
        drop(slave);

        let master = register_master(pty.master).unwrap();
        let mut captured = Vec::new();
        pump_output(master, &mut captured).await.unwrap();
        assert!(String::from_utf8_lossy(&captured).contains("hello"));
    }

    #[tokio::test]
    async fn test_pump_input_reaches_slave() {
        let pty = PtyPair::open().unwrap();
        let master = register_master(pty.master).unwrap();

        // Canonical mode: the line is delivered once the newline arrives
        pump_input(&b"typed\n"[..], master).await.unwrap();

        let mut slave = File::from(pty.slave);
        let mut buffer = [0u8; 6];
        slave.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"typed\n");
    }
}
