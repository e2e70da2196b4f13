//! Datagram transport with descriptor passing
//!
//! Wrappers over `sendmsg`/`recvmsg` on `SOCK_SEQPACKET` unix sockets. The
//! socket type preserves message boundaries, so one receive is always one
//! complete message and no reassembly is needed. Descriptors travel as
//! `SCM_RIGHTS` ancillary data.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

/// Largest payload accepted on a session socket
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Most descriptors accepted in a single datagram
pub const MAX_DESCRIPTORS: usize = 8;

/// One received datagram
#[derive(Debug, Default)]
pub struct Datagram {
    /// Message bytes
    pub payload: Vec<u8>,
    /// Descriptors received with the message, already close-on-exec
    pub fds: Vec<OwnedFd>,
    /// Payload or control data did not fit the receive buffers
    pub truncated: bool,
}

impl Datagram {
    /// A zero-length read with nothing attached means the peer closed its end
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty() && self.fds.is_empty() && !self.truncated
    }
}

/// Create a connected, close-on-exec `SOCK_SEQPACKET` socket pair
pub fn seqpacket_pair() -> nix::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
}

/// Send one datagram, attaching `fds` as transferred descriptors
///
/// `MSG_NOSIGNAL` turns a vanished peer into `EPIPE` instead of `SIGPIPE`.
pub fn send_datagram(
    socket: BorrowedFd<'_>,
    payload: &[u8],
    fds: &[BorrowedFd<'_>],
) -> nix::Result<()> {
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(payload)];
    let rights = [ControlMessage::ScmRights(&raw)];
    let cmsgs: &[ControlMessage] = if raw.is_empty() { &[] } else { &rights };

    loop {
        match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Receive one datagram of at most `capacity` bytes
///
/// Received descriptors are installed with `MSG_CMSG_CLOEXEC` so they never
/// leak into unrelated children. Pass `MsgFlags::MSG_DONTWAIT` from async code.
pub fn recv_datagram(
    socket: BorrowedFd<'_>,
    capacity: usize,
    flags: MsgFlags,
) -> nix::Result<Datagram> {
    let mut payload = vec![0u8; capacity.max(1)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);

    let (bytes, fds, truncated) = loop {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let msg = match recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            flags | MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        };

        let mut truncated = msg.flags.contains(MsgFlags::MSG_TRUNC);
        let mut fds = Vec::new();
        match msg.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        // SAFETY: the kernel just installed these descriptors
                        // in our table and nothing else refers to them.
                        fds.extend(
                            received
                                .into_iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                        );
                    }
                }
            }
            Err(_) => truncated = true,
        }
        break (msg.bytes, fds, truncated);
    };

    payload.truncate(bytes);
    Ok(Datagram {
        payload,
        fds,
        truncated,
    })
}
