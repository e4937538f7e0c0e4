//! Rendezvous endpoint
//!
//! Owns a non-blocking `AF_UNIX` / `SOCK_SEQPACKET` socket together with the
//! address it binds to (server) or connects to (client). Dropping the
//! endpoint closes the socket; a bound endpoint also removes its socket file.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::common::{paths, Error, Result};

use super::sys::{self, cvt};

/// Outcome of a non-blocking connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The connection completed immediately
    Connected,
    /// Completion must be confirmed once the socket turns writable
    InProgress,
}

/// A local socket and the address it is bound or connected to
pub struct Endpoint {
    fd: OwnedFd,
    addr: libc::sockaddr_un,
    addr_len: libc::socklen_t,
    path: PathBuf,
    bound: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("fd", &self.fd.as_raw_fd())
            .field("path", &self.path)
            .field("bound", &self.bound)
            .finish()
    }
}

impl Endpoint {
    /// Allocate a non-blocking, connection-oriented, message-boundary
    /// preserving local socket addressed at `path`
    pub fn create(path: &Path) -> Result<Self> {
        let (addr, addr_len) = socket_addr(path)?;

        // SAFETY: plain socket(2) call, the result is checked below.
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0) };
        if raw == -1 {
            return Err(Error::resource("socket"));
        }
        // SAFETY: socket() returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        sys::set_nonblocking(fd.as_fd())
            .and_then(|()| sys::set_cloexec(fd.as_fd()))
            .map_err(|source| Error::Resource {
                what: "socket",
                source,
            })?;

        Ok(Self {
            fd,
            addr,
            addr_len,
            path: path.to_path_buf(),
            bound: false,
        })
    }

    /// Path this endpoint is addressed at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind to the address and start accepting connections
    ///
    /// Creates the socket directory if needed, removes any stale socket file,
    /// binds, restricts the socket file to its owner and listens with
    /// `backlog` pending connections.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let bind_err = |source: io::Error| Error::Bind {
            path: self.path.display().to_string(),
            source,
        };

        paths::ensure_socket_dir(&self.path).map_err(bind_err)?;
        paths::remove_socket(&self.path).map_err(bind_err)?;

        // SAFETY: addr is a fully initialised sockaddr_un of addr_len bytes.
        cvt(unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                std::ptr::addr_of!(self.addr).cast(),
                self.addr_len,
            )
        })
        .map_err(bind_err)?;
        self.bound = true;

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_err)?;

        // SAFETY: listen on our own bound socket.
        cvt(unsafe { libc::listen(self.fd.as_raw_fd(), backlog) }).map_err(bind_err)?;

        tracing::debug!(path = %self.path.display(), backlog, "Endpoint listening");
        Ok(())
    }

    /// Accept one pending connection
    ///
    /// The accepted socket is made non-blocking. `WouldBlock` means no
    /// connection was pending.
    pub fn accept(&self) -> io::Result<OwnedFd> {
        // SAFETY: accept without a peer address buffer.
        let raw = cvt(unsafe {
            libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
        })?;
        // SAFETY: accept() returned a fresh descriptor that nothing else owns.
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        sys::set_nonblocking(conn.as_fd())?;
        sys::set_cloexec(conn.as_fd())?;
        Ok(conn)
    }

    /// Start a non-blocking connect to the address
    pub fn connect(&self) -> io::Result<ConnectStatus> {
        // SAFETY: addr is a fully initialised sockaddr_un of addr_len bytes.
        let ret = unsafe {
            libc::connect(
                self.fd.as_raw_fd(),
                std::ptr::addr_of!(self.addr).cast(),
                self.addr_len,
            )
        };
        match cvt(ret) {
            Ok(_) => Ok(ConnectStatus::Connected),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(ConnectStatus::InProgress),
            Err(e) => Err(e),
        }
    }

    /// Read and clear the socket's pending error (`SO_ERROR`)
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: error/len describe a c_int-sized output buffer.
        cvt(unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(error).cast(),
                &mut len,
            )
        })?;
        Ok((error != 0).then(|| io::Error::from_raw_os_error(error)))
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.bound {
            if let Err(e) = paths::remove_socket(&self.path) {
                tracing::warn!(path = %self.path.display(), "Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Build a `sockaddr_un` for `path`
fn socket_addr(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data, all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the trailing NUL.
    let max = addr.sun_path.len() - 1;
    if bytes.len() > max {
        return Err(Error::PathTooLong {
            path: path.display().to_string(),
            len: bytes.len(),
            max,
        });
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = std::mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}
