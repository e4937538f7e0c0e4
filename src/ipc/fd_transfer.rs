//! Descriptor handoff over a connected local socket
//!
//! A descriptor travels as `SCM_RIGHTS` ancillary data attached to a single
//! filler byte. The kernel installs a duplicate in the receiving process, so
//! the sender must close its own copy afterwards, whether or not the send
//! reported success.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use crate::common::{Error, Result};

/// Capability to move one open descriptor across a connected channel
pub trait FdTransfer {
    /// Send `fd` over `channel`
    ///
    /// An error means the descriptor may or may not have been delivered.
    fn send_descriptor(&self, channel: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()>;

    /// Receive one descriptor from `channel`
    ///
    /// The caller must already know the channel is readable.
    fn receive_descriptor(&self, channel: BorrowedFd<'_>) -> Result<OwnedFd>;
}

/// `sendmsg`/`recvmsg` with `SCM_RIGHTS` control messages
#[derive(Debug, Clone, Copy, Default)]
pub struct ScmRights;

/// Filler payload; the byte stream itself carries nothing
const FILLER: u8 = 0;

/// Control buffer aligned for `cmsghdr`, with room for a few descriptors
#[repr(C)]
union ControlBuf {
    buf: [u8; 64],
    _align: libc::cmsghdr,
}

fn fd_space() -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) as usize }
}

impl FdTransfer for ScmRights {
    fn send_descriptor(&self, channel: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> Result<()> {
        let mut payload = [FILLER];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        let mut control = ControlBuf { buf: [0u8; 64] };
        let space = fd_space();

        // SAFETY: msghdr is plain old data, all-zero is a valid value.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: taking a pointer to the union's byte view.
        msg.msg_control = unsafe { control.buf.as_mut_ptr() }.cast();
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at `space` bytes of cmsghdr-aligned
        // storage, enough for one header plus one c_int.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<libc::c_int>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd.as_raw_fd());
        }

        // SAFETY: msg and everything it points to outlives the call.
        let n = unsafe { libc::sendmsg(channel.as_raw_fd(), &msg, send_flags()) };
        if n < 0 {
            return Err(Error::transfer("sendmsg"));
        }

        tracing::trace!(channel = channel.as_raw_fd(), fd = fd.as_raw_fd(), "Descriptor sent");
        Ok(())
    }

    fn receive_descriptor(&self, channel: BorrowedFd<'_>) -> Result<OwnedFd> {
        let mut payload = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        let mut control = ControlBuf { buf: [0u8; 64] };

        // SAFETY: msghdr is plain old data, all-zero is a valid value.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: taking a pointer to the union's byte view.
        msg.msg_control = unsafe { control.buf.as_mut_ptr() }.cast();
        msg.msg_controllen = std::mem::size_of::<ControlBuf>() as _;

        // SAFETY: msg and everything it points to outlives the call.
        let n = unsafe { libc::recvmsg(channel.as_raw_fd(), &mut msg, recv_flags()) };
        if n < 0 {
            return Err(Error::transfer("recvmsg"));
        }

        // Everything the kernel installed is owned from here on, so any
        // descriptor not handed back is closed on return.
        let mut received = attached_descriptors(&msg).into_iter();

        if n == 0 {
            return Err(Error::Transfer("peer closed the channel".to_string()));
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(Error::Transfer("control data truncated".to_string()));
        }
        let Some(fd) = received.next() else {
            return Err(Error::Transfer("no descriptor attached".to_string()));
        };

        let extra = received.len();
        if extra > 0 {
            tracing::warn!(extra, "Closing unexpected extra descriptors");
        }
        tracing::trace!(channel = channel.as_raw_fd(), fd = fd.as_raw_fd(), "Descriptor received");
        Ok(fd)
    }
}

/// Take ownership of every `SCM_RIGHTS` descriptor carried by `msg`
fn attached_descriptors(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    let int_size = std::mem::size_of::<libc::c_int>();

    // SAFETY: msg was filled by a successful recvmsg; CMSG_FIRSTHDR and
    // CMSG_NXTHDR stay within msg_control and return null at the end. Each
    // SCM_RIGHTS payload holds (cmsg_len - CMSG_LEN(0)) / sizeof(int)
    // descriptors that the kernel installed in this process.
    unsafe {
        let header = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header) / int_size;
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    fds
}

#[cfg(target_os = "linux")]
fn send_flags() -> libc::c_int {
    libc::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn send_flags() -> libc::c_int {
    0
}

#[cfg(target_os = "linux")]
fn recv_flags() -> libc::c_int {
    libc::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> libc::c_int {
    0
}
