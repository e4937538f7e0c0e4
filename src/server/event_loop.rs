//! Server event loop
//!
//! Single-threaded readiness loop over the listening endpoint (slot 0) and
//! every tracked connection. Each iteration services the listener first,
//! then connections in ascending slot order.

use std::fmt;
use std::io;
use std::os::fd::AsFd;
use std::time::Duration;

use crate::common::{config::Config, Error, Result};
use crate::ipc::endpoint::Endpoint;
use crate::ipc::fd_transfer::{FdTransfer, ScmRights};
use crate::ipc::message::{Message, PACKET_SIZE};
use crate::ipc::poll::{Interest, PollSet, Readiness};
use crate::ipc::sys;

use super::connection::Connection;
use super::slots::{SlotTable, LISTENER_SLOT};

/// Why a connection slot was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Reading completed or failed
    Finished,
    /// Peer closed its end
    HangUp,
    /// Descriptor was not open
    InvalidDescriptor,
    /// Error condition reported by the readiness wait
    ErrorCondition,
}

/// Something that happened during one loop iteration
#[derive(Debug)]
pub enum ServerEvent {
    /// A connection was accepted into `slot`
    Accepted { slot: usize, connection: u64 },
    /// `accept` failed; the loop carries on
    AcceptFailed(io::Error),
    /// A connection was accepted but no slot was free, so it was closed
    Rejected { capacity: usize },
    /// The client received its pipe write end
    HandedOff { slot: usize, connection: u64 },
    /// A complete message arrived
    Received {
        slot: usize,
        connection: u64,
        message: Message,
    },
    /// Reading the channel failed; always [`Error::Read`]
    ReadFailed {
        slot: usize,
        connection: u64,
        error: Error,
    },
    /// The slot was freed
    Closed {
        slot: usize,
        connection: u64,
        reason: CloseReason,
    },
}

impl ServerEvent {
    /// Line printed to stdout for this event, if any
    pub fn trace(&self) -> Option<String> {
        match self {
            ServerEvent::Accepted { .. } => Some("new connection".to_string()),
            ServerEvent::AcceptFailed(_) => {
                Some("failed to accept connection, continuing…".to_string())
            }
            ServerEvent::Rejected { .. } => Some("can't accept any more clients".to_string()),
            ServerEvent::Received { message, .. } => Some(received_trace(message)),
            ServerEvent::ReadFailed { error, .. } => match error {
                Error::Read(source) => Some(format!("read failed: {}", source)),
                other => Some(format!("read failed: {}", other)),
            },
            ServerEvent::Closed { reason, .. } => match reason {
                CloseReason::Finished => None,
                CloseReason::HangUp => Some("client closed its end of channel".to_string()),
                CloseReason::InvalidDescriptor => {
                    Some("invalid request, fd not open".to_string())
                }
                CloseReason::ErrorCondition => Some("error condition".to_string()),
            },
            ServerEvent::HandedOff { .. } => None,
        }
    }
}

fn received_trace(message: &Message) -> String {
    if message.is_truncated() {
        format!(
            "{} bytes received, rejecting remainder (if any)\nreceived: {}",
            PACKET_SIZE, message
        )
    } else {
        format!("received: {}", message)
    }
}

/// The rendezvous server
pub struct Server<T: FdTransfer = ScmRights> {
    endpoint: Endpoint,
    slots: SlotTable<Connection>,
    transfer: T,
    poll: PollSet,
    /// Slot index for each connection entry in `poll`, in push order
    order: Vec<usize>,
    next_id: u64,
}

impl<T: FdTransfer> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.endpoint)
            .field("active", &self.slots.len())
            .field("capacity", &self.slots.capacity())
            .finish()
    }
}

impl Server<ScmRights> {
    /// Bind the rendezvous socket described by `config`
    pub fn bind(config: &Config) -> Result<Self> {
        let mut endpoint = Endpoint::create(&config.socket.path)?;
        endpoint.listen(config.server.backlog)?;

        let capacity = slot_capacity(config.server.max_connections)?;
        tracing::info!(
            path = %config.socket.path.display(),
            capacity,
            "Server listening"
        );

        Ok(Self::with_transfer(endpoint, capacity, ScmRights))
    }
}

/// Connection slots available: the descriptor limit minus the listener,
/// optionally lowered by configuration
fn slot_capacity(limit: Option<usize>) -> Result<usize> {
    let open_max = sys::open_max().map_err(|source| Error::Resource {
        what: "descriptor table",
        source,
    })?;
    let capacity = open_max.saturating_sub(1);
    Ok(limit.map_or(capacity, |limit| limit.min(capacity)))
}

impl<T: FdTransfer> Server<T> {
    /// Build a server over an already listening endpoint
    pub fn with_transfer(endpoint: Endpoint, capacity: usize, transfer: T) -> Self {
        Self {
            endpoint,
            slots: SlotTable::with_capacity(capacity),
            transfer,
            poll: PollSet::new(),
            order: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of connections currently tracked
    pub fn active_connections(&self) -> usize {
        self.slots.len()
    }

    /// Maximum number of tracked connections
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// One past the highest occupied slot index
    pub fn high_water(&self) -> usize {
        self.slots.high_water()
    }

    /// Run forever, printing the connection trace to stdout
    ///
    /// Only returns on a fatal error.
    pub fn run(mut self) -> Result<()> {
        loop {
            for event in self.turn(None)? {
                if let Some(line) = event.trace() {
                    println!("{}", line);
                }
            }
        }
    }

    /// Perform one readiness wait and service whatever became ready
    ///
    /// `None` waits indefinitely. Per-connection faults are reported as
    /// events; only readiness-wait and handoff failures are returned as
    /// errors.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Vec<ServerEvent>> {
        let mut events = Vec::new();

        self.poll.clear();
        self.order.clear();
        let listener = self.poll.push(self.endpoint.as_fd(), Interest::Readable);
        debug_assert_eq!(listener, LISTENER_SLOT);
        for (index, conn) in self.slots.iter() {
            self.poll.push(conn.fd(), conn.interest());
            self.order.push(index);
        }

        let ready = self.poll.wait(timeout).map_err(Error::Poll)?;
        if ready == 0 {
            return Ok(events);
        }

        let listener = self.poll.readiness(LISTENER_SLOT);
        if listener.is_readable() {
            self.accept(&mut events);
        } else if !listener.is_empty() {
            tracing::warn!(?listener, "Unexpected readiness on listening socket");
        }

        for pos in 0..self.order.len() {
            let index = self.order[pos];
            let readiness = self.poll.readiness(pos + 1);
            self.service(index, readiness, &mut events)?;
        }

        Ok(events)
    }

    fn accept(&mut self, events: &mut Vec<ServerEvent>) {
        let socket = match self.endpoint.accept() {
            Ok(socket) => socket,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!("Listener readable but no connection pending");
                return;
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                events.push(ServerEvent::AcceptFailed(e));
                return;
            }
        };

        let id = self.next_id;
        self.next_id += 1;

        match self.slots.allocate(Connection::accepted(id, socket)) {
            Ok(slot) => {
                tracing::debug!(slot, connection = id, "Accepted connection");
                events.push(ServerEvent::Accepted {
                    slot,
                    connection: id,
                });
            }
            Err(e) => {
                // allocate() dropped the connection, closing its socket.
                tracing::warn!(connection = id, "Dropping connection: {}", e);
                events.push(ServerEvent::Rejected {
                    capacity: self.slots.capacity(),
                });
            }
        }
    }

    fn service(
        &mut self,
        slot: usize,
        readiness: Readiness,
        events: &mut Vec<ServerEvent>,
    ) -> Result<()> {
        if readiness.is_empty() {
            return Ok(());
        }
        let Some(conn) = self.slots.get_mut(slot) else {
            return Ok(());
        };
        let connection = conn.id();
        let faulted = readiness.is_hangup() || readiness.is_invalid() || readiness.is_error();

        if conn.is_handoff_pending() {
            if readiness.is_writable() && !faulted {
                conn.hand_off(&self.transfer)?;
                events.push(ServerEvent::HandedOff { slot, connection });
                return Ok(());
            }
        } else if readiness.is_readable() || readiness.is_hangup() {
            // After a hang-up nothing more will be written, so read to the end.
            match conn.receive(readiness.is_hangup()) {
                Ok(Some(message)) => {
                    tracing::debug!(
                        slot,
                        connection,
                        len = message.as_bytes().len(),
                        truncated = message.is_truncated(),
                        "Message received"
                    );
                    events.push(ServerEvent::Received {
                        slot,
                        connection,
                        message,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(slot, connection, "Read failed: {}", error);
                    events.push(ServerEvent::ReadFailed {
                        slot,
                        connection,
                        error: Error::Read(error),
                    });
                }
            }
        }

        let reason = if readiness.is_hangup() {
            CloseReason::HangUp
        } else if readiness.is_invalid() {
            CloseReason::InvalidDescriptor
        } else if readiness.is_error() {
            CloseReason::ErrorCondition
        } else if conn.is_finished() {
            CloseReason::Finished
        } else {
            return Ok(());
        };

        self.slots.free(slot);
        tracing::debug!(slot, connection, ?reason, "Closed connection");
        events.push(ServerEvent::Closed {
            slot,
            connection,
            reason,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{self, MessageBuffer, Progress};
    use crate::ipc::sys::seqpacket_pair;
    use std::os::fd::OwnedFd;
    use std::path::Path;

    fn listening(dir: &Path) -> Server {
        let mut endpoint = Endpoint::create(&dir.join("sock")).unwrap();
        endpoint.listen(4).unwrap();
        Server::with_transfer(endpoint, 4, ScmRights)
    }

    fn service(server: &mut Server, slot: usize, revents: libc::c_short) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        server
            .service(slot, Readiness::from_revents(revents), &mut events)
            .unwrap();
        events
    }

    #[test]
    fn test_received_trace() {
        let mut buffer = MessageBuffer::new();
        buffer.spare_mut()[..6].copy_from_slice(b"hello\0");
        let Progress::Complete(msg) = buffer.advance(6) else {
            panic!("expected complete message");
        };
        assert_eq!(received_trace(&msg), "received: hello");
    }

    #[test]
    fn test_truncated_trace_has_notice() {
        let mut buffer = MessageBuffer::new();
        let wire = message::encode(&[b'x'; 600]);
        let n = buffer.spare_mut().len();
        buffer.spare_mut().copy_from_slice(&wire[..n]);
        let Progress::Complete(msg) = buffer.advance(n) else {
            panic!("expected complete message");
        };

        let trace = received_trace(&msg);
        let mut lines = trace.lines();
        assert_eq!(
            lines.next(),
            Some("506 bytes received, rejecting remainder (if any)")
        );
        assert_eq!(
            lines.next().map(str::to_string),
            Some(format!("received: {}", "x".repeat(505)))
        );
    }

    #[test]
    fn test_finished_close_is_silent() {
        let event = ServerEvent::Closed {
            slot: 1,
            connection: 1,
            reason: CloseReason::Finished,
        };
        assert!(event.trace().is_none());
    }

    #[test]
    fn test_hangup_close_is_reported() {
        let event = ServerEvent::Closed {
            slot: 1,
            connection: 1,
            reason: CloseReason::HangUp,
        };
        assert_eq!(
            event.trace().as_deref(),
            Some("client closed its end of channel")
        );
    }

    #[test]
    fn test_error_condition_skips_handoff_and_frees_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = listening(tmp.path());
        let (socket, _peer) = seqpacket_pair();
        let slot = server.slots.allocate(Connection::accepted(1, socket)).unwrap();

        let events = service(&mut server, slot, libc::POLLOUT | libc::POLLERR);

        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Closed {
                slot: 1,
                connection: 1,
                reason: CloseReason::ErrorCondition,
            }]
        ));
        assert_eq!(events[0].trace().as_deref(), Some("error condition"));
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn test_invalid_descriptor_frees_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = listening(tmp.path());
        let (read_end, _write_end) = sys::pipe().unwrap();
        let slot = server
            .slots
            .allocate(Connection::receiving(2, read_end))
            .unwrap();

        let events = service(&mut server, slot, libc::POLLNVAL);

        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Closed {
                connection: 2,
                reason: CloseReason::InvalidDescriptor,
                ..
            }]
        ));
        assert_eq!(
            events[0].trace().as_deref(),
            Some("invalid request, fd not open")
        );
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn test_read_failure_is_reported_then_slot_freed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = listening(tmp.path());
        // Reading a directory fails with EISDIR.
        let dir = OwnedFd::from(std::fs::File::open(tmp.path()).unwrap());
        let slot = server.slots.allocate(Connection::receiving(3, dir)).unwrap();

        let events = service(&mut server, slot, libc::POLLIN);

        assert_eq!(events.len(), 2, "{:?}", events);
        match &events[0] {
            ServerEvent::ReadFailed {
                connection: 3,
                error: Error::Read(source),
                ..
            } => assert_eq!(source.raw_os_error(), Some(libc::EISDIR)),
            other => panic!("expected read failure, got {:?}", other),
        }
        assert!(events[0].trace().unwrap().starts_with("read failed: "));
        assert!(matches!(
            events[1],
            ServerEvent::Closed {
                connection: 3,
                reason: CloseReason::Finished,
                ..
            }
        ));
        assert_eq!(server.active_connections(), 0);
    }

    #[test]
    fn test_quiet_slot_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = listening(tmp.path());
        let (read_end, _write_end) = sys::pipe().unwrap();
        let slot = server
            .slots
            .allocate(Connection::receiving(4, read_end))
            .unwrap();

        assert!(service(&mut server, slot, 0).is_empty());
        assert_eq!(server.active_connections(), 1);
    }

    #[test]
    fn test_slot_capacity_honours_limit() {
        assert_eq!(slot_capacity(Some(3)).unwrap(), 3);
        assert!(slot_capacity(None).unwrap() >= 1);
    }
}
