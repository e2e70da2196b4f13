//! End-to-end session tests against an in-process agent
//!
//! The daemon runs on a thread of the test process and talks to the
//! front-end over a socket pair, exactly as it would over descriptor 3.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::socket::MsgFlags;
use nix::unistd::Pid;

use ctxterm::agent::{Daemon, DaemonError, ShutdownReason};
use ctxterm::config::SessionSettings;
use ctxterm::context::ControlChannel;
use ctxterm::protocol::{
    recv_datagram, send_datagram, seqpacket_pair, CommandSpec, MAX_MESSAGE_SIZE,
};
use ctxterm::session::{SessionError, SessionEvent, SessionProxy, SessionState};
use ctxterm::terminal::{pump_output, register_master};

type DaemonHandle = JoinHandle<Result<ShutdownReason, DaemonError>>;

fn start_agent() -> (ControlChannel, DaemonHandle) {
    let (front, agent) = seqpacket_pair().unwrap();
    let daemon = std::thread::spawn(move || {
        let mut daemon = Daemon::new(agent, SessionSettings::default());
        let reason = daemon.run();
        daemon.wait_sessions();
        reason
    });
    (ControlChannel::from_socket(front), daemon)
}

/// Wait for the pty, then for the exit code; the master is kept open
async fn run_session(session: &mut SessionProxy) -> (OwnedFd, i32) {
    let master = match session.next_event().await.unwrap() {
        Some(SessionEvent::PtyReady(master)) => master,
        other => panic!("Expected pty, got {:?}", other),
    };
    let code = match session.next_event().await.unwrap() {
        Some(SessionEvent::Exited(code)) => code,
        other => panic!("Expected exit code, got {:?}", other),
    };
    (master, code)
}

async fn exit_code_of(channel: &ControlChannel, spec: CommandSpec) -> i32 {
    let mut session = channel.create_session(spec).unwrap();
    let (_master, code) = run_session(&mut session).await;
    code
}

/// Everything the command printed, once all slave descriptors are closed
async fn output_of(master: OwnedFd) -> String {
    let mut captured = Vec::new();
    pump_output(register_master(master).unwrap(), &mut captured)
        .await
        .unwrap();
    String::from_utf8_lossy(&captured).into_owned()
}

fn pty_number(master: &OwnedFd) -> u32 {
    let mut number: libc::c_uint = 0;
    // SAFETY: TIOCGPTN writes an unsigned int into the pointed-to value.
    let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGPTN, &mut number) };
    assert_eq!(rc, 0);
    number
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new(["sh", "-c", script])
}

#[tokio::test]
async fn test_echo_reports_zero() {
    let (channel, _daemon) = start_agent();
    let mut session = channel.create_session(CommandSpec::new(["echo", "hi"])).unwrap();

    let (master, code) = run_session(&mut session).await;
    assert_eq!(code, 0);
    assert_eq!(session.state(), SessionState::Exited(0));
    assert!(session.next_event().await.unwrap().is_none());
    assert!(output_of(master).await.contains("hi"));
}

#[tokio::test]
async fn test_no_pty_before_start() {
    let (channel, _daemon) = start_agent();
    let mut session = SessionProxy::create(&channel).unwrap();
    assert!(matches!(
        session.next_event().await,
        Err(SessionError::NotStarted)
    ));

    session.start(CommandSpec::new(["true"])).unwrap();
    let (_master, code) = run_session(&mut session).await;
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let (channel, _daemon) = start_agent();

    let mut sessions: Vec<SessionProxy> = (0..5)
        .map(|i| {
            channel
                .create_session(sh(&format!("sleep 0.2; exit {}", i)))
                .unwrap()
        })
        .collect();

    let mut masters = Vec::new();
    for session in &mut sessions {
        match session.next_event().await.unwrap() {
            Some(SessionEvent::PtyReady(master)) => masters.push(master),
            other => panic!("Expected pty, got {:?}", other),
        }
    }
    let numbers: HashSet<u32> = masters.iter().map(pty_number).collect();
    assert_eq!(numbers.len(), 5);

    for (i, session) in sessions.iter_mut().enumerate() {
        match session.next_event().await.unwrap() {
            Some(SessionEvent::Exited(code)) => assert_eq!(code, i as i32),
            other => panic!("Expected exit code, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_missing_program_reports_127() {
    let (channel, _daemon) = start_agent();
    let code = exit_code_of(&channel, CommandSpec::new(["/nonexistent/ctxterm-test"])).await;
    assert_eq!(code, 127);
}

#[tokio::test]
async fn test_signal_reports_128_plus_signal() {
    let (channel, _daemon) = start_agent();
    let code = exit_code_of(&channel, sh("kill -TERM $$")).await;
    assert_eq!(code, 128 + libc::SIGTERM);
}

#[tokio::test]
async fn test_term_and_env() {
    let (channel, _daemon) = start_agent();

    let spec = sh(r#"test "$TERM" = xterm-256color && test "$GREETING" = hello"#)
        .with_env("GREETING", "hello");
    assert_eq!(exit_code_of(&channel, spec).await, 0);

    let spec = sh(r#"test "$TERM" = vt100"#).with_env("TERM", "vt100");
    assert_eq!(exit_code_of(&channel, spec).await, 0);
}

#[tokio::test]
async fn test_working_directory() {
    let (channel, _daemon) = start_agent();
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let spec = sh(&format!(r#"test "$(pwd -P)" = "{}""#, expected.display())).with_cwd(dir.path());
    assert_eq!(exit_code_of(&channel, spec).await, 0);
}

#[tokio::test]
async fn test_aux_descriptor_becomes_stdin() {
    let (channel, _daemon) = start_agent();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input");
    std::fs::write(&path, "from-file\n").unwrap();

    let input: OwnedFd = File::open(&path).unwrap().into();
    let spec = sh(r#"read line && test "$line" = from-file"#).with_aux_fd(input);
    assert_eq!(exit_code_of(&channel, spec).await, 0);
}

#[tokio::test]
async fn test_default_shell_session() {
    let (channel, _daemon) = start_agent();
    let mut session = channel.create_session(CommandSpec::shell()).unwrap();

    let master = match session.next_event().await.unwrap() {
        Some(SessionEvent::PtyReady(master)) => master,
        other => panic!("Expected pty, got {:?}", other),
    };
    let mut terminal = File::from(master.try_clone().unwrap());
    terminal.write_all(b"exit 3\n").unwrap();

    match session.next_event().await.unwrap() {
        Some(SessionEvent::Exited(code)) => assert_eq!(code, 3),
        other => panic!("Expected exit code, got {:?}", other),
    }
    drop(master);
}

#[tokio::test]
async fn test_malformed_request_is_plain_eof() {
    let (channel, _daemon) = start_agent();
    let (ours, theirs) = seqpacket_pair().unwrap();
    channel.request_session(theirs).unwrap();

    send_datagram(ours.as_fd(), b"{\"args\": 42", &[]).unwrap();
    let reply = recv_datagram(ours.as_fd(), MAX_MESSAGE_SIZE, MsgFlags::empty()).unwrap();
    assert!(reply.is_eof());
}

#[tokio::test]
async fn test_empty_control_datagram_shuts_down() {
    let (channel, daemon) = start_agent();
    channel.shutdown();
    assert_eq!(daemon.join().unwrap().unwrap(), ShutdownReason::Requested);
}

#[tokio::test]
async fn test_running_session_survives_shutdown() {
    let (channel, daemon) = start_agent();
    let mut session = channel.create_session(sh("sleep 0.3; exit 4")).unwrap();
    let master = match session.next_event().await.unwrap() {
        Some(SessionEvent::PtyReady(master)) => master,
        other => panic!("Expected pty, got {:?}", other),
    };

    channel.shutdown();
    assert!(matches!(
        session.next_event().await.unwrap(),
        Some(SessionEvent::Exited(4))
    ));
    assert_eq!(daemon.join().unwrap().unwrap(), ShutdownReason::Requested);
    drop(master);
}

/// Wait for the command to write a pid into `path`
async fn pid_from(path: &Path) -> Pid {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let written = std::fs::read_to_string(path).unwrap_or_default();
        if let Ok(pid) = written.trim().parse::<i32>() {
            return Pid::from_raw(pid);
        }
        assert!(Instant::now() < deadline, "command never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `pid` no longer exists
async fn assert_gone(pid: Pid) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while kill(pid, None) != Err(Errno::ESRCH) {
        assert!(Instant::now() < deadline, "process {} survived its session", pid);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_closing_proxy_kills_command() {
    let (channel, _daemon) = start_agent();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");

    let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
    let mut session = channel.create_session(sh(&script)).unwrap();
    let master = match session.next_event().await.unwrap() {
        Some(SessionEvent::PtyReady(master)) => master,
        other => panic!("Expected pty, got {:?}", other),
    };

    let pid = pid_from(&pid_file).await;
    session.close();
    assert_gone(pid).await;
    drop(master);
}

#[tokio::test]
async fn test_closing_proxy_kills_process_group() {
    let (channel, _daemon) = start_agent();
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("background");

    // The background sleep shares the shell's process group
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let mut session = channel.create_session(sh(&script)).unwrap();
    let master = match session.next_event().await.unwrap() {
        Some(SessionEvent::PtyReady(master)) => master,
        other => panic!("Expected pty, got {:?}", other),
    };

    let background = pid_from(&pid_file).await;
    session.close();
    assert_gone(background).await;
    drop(master);
}
