//! Per-connection state machine
//!
//! A connection starts on the accepted rendezvous socket waiting to become
//! writable, hands the client the write end of a fresh pipe, then waits on
//! the pipe's read end until one message has arrived.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::common::{Error, Result};
use crate::ipc::fd_transfer::FdTransfer;
use crate::ipc::message::{Message, MessageBuffer, Progress};
use crate::ipc::poll::Interest;
use crate::ipc::sys;

/// Where a connection is in the handshake
#[derive(Debug)]
pub enum Phase {
    /// Accepted, waiting for the socket to accept the handoff
    HandoffPending { socket: OwnedFd },
    /// Pipe handed off, reading the message from its read end
    Receiving {
        channel: OwnedFd,
        buffer: MessageBuffer,
    },
}

/// One tracked client
#[derive(Debug)]
pub struct Connection {
    id: u64,
    phase: Phase,
}

enum ReadStep {
    Complete(Message),
    Pending,
    WouldBlock,
}

impl Connection {
    /// Track a freshly accepted rendezvous socket
    pub fn accepted(id: u64, socket: OwnedFd) -> Self {
        Self {
            id,
            phase: Phase::HandoffPending { socket },
        }
    }

    /// Track a channel that is already past the handoff
    #[cfg(test)]
    pub(crate) fn receiving(id: u64, channel: OwnedFd) -> Self {
        Self {
            id,
            phase: Phase::Receiving {
                channel,
                buffer: MessageBuffer::new(),
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Descriptor currently being watched
    pub fn fd(&self) -> BorrowedFd<'_> {
        match &self.phase {
            Phase::HandoffPending { socket } => socket.as_fd(),
            Phase::Receiving { channel, .. } => channel.as_fd(),
        }
    }

    pub fn interest(&self) -> Interest {
        match self.phase {
            Phase::HandoffPending { .. } => Interest::Writable,
            Phase::Receiving { .. } => Interest::Readable,
        }
    }

    pub fn is_handoff_pending(&self) -> bool {
        matches!(self.phase, Phase::HandoffPending { .. })
    }

    /// Reading is over, successfully or not
    pub fn is_finished(&self) -> bool {
        match &self.phase {
            Phase::HandoffPending { .. } => false,
            Phase::Receiving { buffer, .. } => buffer.is_finished(),
        }
    }

    /// Create a pipe and hand its write end to the client
    ///
    /// On success the rendezvous socket and the local write end are closed
    /// and the connection watches the read end. On failure both pipe ends
    /// are closed and the connection is left untouched.
    pub fn hand_off<T: FdTransfer>(&mut self, transfer: &T) -> Result<()> {
        let Phase::HandoffPending { socket } = &self.phase else {
            return Ok(());
        };

        let (read_end, write_end) = sys::pipe().map_err(|source| Error::Resource {
            what: "pipe",
            source,
        })?;
        transfer.send_descriptor(socket.as_fd(), write_end.as_fd())?;

        tracing::debug!(
            connection = self.id,
            socket = socket.as_raw_fd(),
            pipe = read_end.as_raw_fd(),
            "Handed off pipe write end"
        );
        drop(write_end);
        self.phase = Phase::Receiving {
            channel: read_end,
            buffer: MessageBuffer::new(),
        };
        Ok(())
    }

    /// Read from the channel
    ///
    /// With `drain` set, keeps reading until the message completes or the
    /// channel has nothing more; used once the writer has hung up. A read
    /// error finishes the connection and is returned.
    pub fn receive(&mut self, drain: bool) -> io::Result<Option<Message>> {
        loop {
            match self.read_once()? {
                ReadStep::Complete(message) => return Ok(Some(message)),
                ReadStep::Pending if drain => continue,
                ReadStep::Pending | ReadStep::WouldBlock => return Ok(None),
            }
        }
    }

    fn read_once(&mut self) -> io::Result<ReadStep> {
        let Phase::Receiving { channel, buffer } = &mut self.phase else {
            return Ok(ReadStep::WouldBlock);
        };
        if buffer.is_finished() {
            return Ok(ReadStep::WouldBlock);
        }

        match buffer.read_from(channel.as_fd()) {
            Ok(Progress::Complete(message)) => Ok(ReadStep::Complete(message)),
            Ok(Progress::Pending) => Ok(ReadStep::Pending),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(ReadStep::WouldBlock)
            }
            Err(e) => {
                buffer.abandon();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::fd_transfer::ScmRights;
    use crate::ipc::sys::seqpacket_pair;

    struct RefusingTransfer;

    impl FdTransfer for RefusingTransfer {
        fn send_descriptor(&self, _: BorrowedFd<'_>, _: BorrowedFd<'_>) -> Result<()> {
            Err(Error::Transfer("refused".to_string()))
        }

        fn receive_descriptor(&self, _: BorrowedFd<'_>) -> Result<OwnedFd> {
            Err(Error::Transfer("refused".to_string()))
        }
    }

    #[test]
    fn test_accepted_connection_waits_for_writable() {
        let (server_side, _client_side) = seqpacket_pair();
        let conn = Connection::accepted(7, server_side);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.interest(), Interest::Writable);
        assert!(conn.is_handoff_pending());
        assert!(!conn.is_finished());
    }

    #[test]
    fn test_hand_off_switches_to_pipe() {
        let (server_side, client_side) = seqpacket_pair();
        let mut conn = Connection::accepted(1, server_side);

        conn.hand_off(&ScmRights).unwrap();
        assert_eq!(conn.interest(), Interest::Readable);
        assert!(!conn.is_handoff_pending());

        let write_end = ScmRights.receive_descriptor(client_side.as_fd()).unwrap();
        sys::write(write_end.as_fd(), b"ping\0").unwrap();

        let message = conn.receive(false).unwrap().unwrap();
        assert_eq!(message.as_bytes(), b"ping");
        assert!(conn.is_finished());
    }

    #[test]
    fn test_failed_hand_off_keeps_phase() {
        let (server_side, _client_side) = seqpacket_pair();
        let mut conn = Connection::accepted(1, server_side);

        let err = conn.hand_off(&RefusingTransfer).unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
        assert!(conn.is_handoff_pending());
    }

    #[test]
    fn test_receive_partial_then_drain_on_hangup() {
        let (server_side, client_side) = seqpacket_pair();
        let mut conn = Connection::accepted(1, server_side);
        conn.hand_off(&ScmRights).unwrap();

        let write_end = ScmRights.receive_descriptor(client_side.as_fd()).unwrap();
        sys::write(write_end.as_fd(), b"part").unwrap();
        assert_eq!(conn.receive(false).unwrap(), None);

        sys::write(write_end.as_fd(), b"ial").unwrap();
        drop(write_end);

        let message = conn.receive(true).unwrap().unwrap();
        assert_eq!(message.as_bytes(), b"partial");
    }

    #[test]
    fn test_receive_with_nothing_written_is_pending() {
        let (server_side, client_side) = seqpacket_pair();
        let mut conn = Connection::accepted(1, server_side);
        conn.hand_off(&ScmRights).unwrap();
        let _write_end = ScmRights.receive_descriptor(client_side.as_fd()).unwrap();

        assert_eq!(conn.receive(true).unwrap(), None);
        assert!(!conn.is_finished());
    }
}
