//! Readiness wait over a set of descriptors (`poll(2)`)

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

/// What a descriptor is being watched for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn events(self) -> libc::c_short {
        match self {
            Interest::Readable => libc::POLLIN,
            Interest::Writable => libc::POLLOUT,
        }
    }
}

/// Conditions observed on one descriptor after a wait
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(libc::c_short);

impl Readiness {
    /// Wrap raw `revents` bits
    pub(crate) fn from_revents(revents: libc::c_short) -> Self {
        Self(revents)
    }

    pub fn is_readable(self) -> bool {
        self.0 & libc::POLLIN != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & libc::POLLOUT != 0
    }

    /// Peer closed its end
    pub fn is_hangup(self) -> bool {
        self.0 & libc::POLLHUP != 0
    }

    /// Descriptor was not open
    pub fn is_invalid(self) -> bool {
        self.0 & libc::POLLNVAL != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & libc::POLLERR != 0
    }

    /// Nothing was reported
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Ordered list of watched descriptors, rebuilt each loop iteration
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Watch `fd`, returning its position in the set
    ///
    /// The descriptor must stay open until the next [`PollSet::clear`].
    pub fn push(&mut self, fd: BorrowedFd<'_>, interest: Interest) -> usize {
        self.fds.push(libc::pollfd {
            fd: fd.as_raw_fd(),
            events: interest.events(),
            revents: 0,
        });
        self.fds.len() - 1
    }

    /// Readiness observed at position `index` by the last wait
    pub fn readiness(&self, index: usize) -> Readiness {
        self.fds
            .get(index)
            .map_or(Readiness::default(), |p| Readiness::from_revents(p.revents))
    }

    /// Block until at least one descriptor is ready
    ///
    /// `None` waits indefinitely. Returns the number of ready descriptors,
    /// 0 only when a timeout elapsed. Interrupted waits are retried.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, |t| {
            t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
        });

        for p in &mut self.fds {
            p.revents = 0;
        }

        loop {
            // SAFETY: fds is a valid array of fds.len() pollfd entries.
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
            };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
