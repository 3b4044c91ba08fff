//! Passing accepted connections from the supervisor to a worker.
//!
//! Each worker owns the receiving end of a `SOCK_SEQPACKET` Unix socket pair.
//! One message carries one connection: the descriptor travels as
//! `SCM_RIGHTS` ancillary data and the payload is the index of the port it
//! was accepted on, as a native-endian `u32`. Message boundaries are kept by
//! the socket type, so a short read is always a malformed message.

use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::HandoffError;

const PAYLOAD: usize = mem::size_of::<u32>();

/// A connection received from the supervisor.
#[derive(Debug)]
pub struct Handoff {
    pub stream: TcpStream,
    /// Index into the sitefile's port declarations.
    pub port: usize,
}

/// Supervisor end of a control channel.
#[derive(Debug)]
pub struct HandoffSender {
    fd: OwnedFd,
}

/// Worker end of a control channel. Non-blocking.
#[derive(Debug)]
pub struct HandoffReceiver {
    fd: OwnedFd,
}

/// Creates a connected control channel.
pub fn channel() -> io::Result<(HandoffSender, HandoffReceiver)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let (send, recv) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let flags = unsafe { libc::fcntl(recv.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(recv.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((HandoffSender { fd: send }, HandoffReceiver { fd: recv }))
}

/// Control buffer large enough for one descriptor, aligned for `cmsghdr`.
fn control_buffer() -> Vec<u64> {
    let bytes = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) } as usize;
    vec![0u64; bytes.div_ceil(mem::size_of::<u64>())]
}

impl HandoffSender {
    /// Sends a duplicate of `stream`'s descriptor tagged with `port`.
    ///
    /// The caller keeps its own descriptor and closes it once the send
    /// succeeded, or tries another channel with it.
    ///
    /// # Arguments
    /// - `stream`: The accepted connection
    /// - `port`: Index of the port it was accepted on
    ///
    /// # Errors
    /// - Returns `HandoffError::Busy` if the worker has not drained its queue
    /// - Returns `HandoffError::Closed` if the worker end is gone
    /// - Returns `HandoffError::Io` for any other `sendmsg` failure
    pub fn send(&self, stream: &impl AsRawFd, port: u32) -> Result<(), HandoffError> {
        let mut payload = port.to_ne_bytes();
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        let mut control = control_buffer();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as u32) } as _;

        let raw = stream.as_raw_fd();
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(HandoffError::Malformed("control buffer too small"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::c_int>() as u32) as _;
            std::ptr::copy_nonoverlapping(
                raw.to_ne_bytes().as_ptr(),
                libc::CMSG_DATA(cmsg),
                mem::size_of::<libc::c_int>(),
            );
        }

        loop {
            let n = unsafe {
                libc::sendmsg(
                    self.fd.as_raw_fd(),
                    &msg,
                    libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT,
                )
            };
            if n >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(HandoffError::Busy),
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => return Err(HandoffError::Closed),
                _ => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl HandoffReceiver {
    /// Receives the next connection. `Ok(None)` means nothing is queued.
    pub fn recv(&self) -> Result<Option<Handoff>, HandoffError> {
        let mut payload = [0u8; PAYLOAD + 1];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        let mut control = control_buffer();

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

        let n = loop {
            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err.into()),
            }
        };

        // Take ownership of every descriptor first so none leak on error.
        let mut fds = received_fds(&msg);
        if n == 0 && fds.is_empty() {
            return Err(HandoffError::Closed);
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(HandoffError::Malformed("control data truncated"));
        }
        if msg.msg_flags & libc::MSG_TRUNC != 0 || n != PAYLOAD {
            return Err(HandoffError::Malformed("unexpected payload size"));
        }
        if fds.len() != 1 {
            return Err(HandoffError::Malformed("expected exactly one descriptor"));
        }
        let fd = fds.remove(0);

        let mut port = [0u8; PAYLOAD];
        port.copy_from_slice(&payload[..PAYLOAD]);
        Ok(Some(Handoff {
            stream: TcpStream::from(fd),
            port: u32::from_ne_bytes(port) as usize,
        }))
    }
}

fn received_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let (level, kind, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len as usize) };
        if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
            let header = unsafe { libc::CMSG_LEN(0) } as usize;
            let count = len.saturating_sub(header) / mem::size_of::<libc::c_int>();
            let data = unsafe { libc::CMSG_DATA(cmsg) };
            for i in 0..count {
                let mut raw = [0u8; mem::size_of::<libc::c_int>()];
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.add(i * raw.len()),
                        raw.as_mut_ptr(),
                        raw.len(),
                    );
                }
                fds.push(unsafe { OwnedFd::from_raw_fd(libc::c_int::from_ne_bytes(raw)) });
            }
        } else {
            log::warn!("ignoring control message {}/{}", level, kind);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    fds
}

impl AsRawFd for HandoffReceiver {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsRawFd for HandoffSender {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
