//! Message framing for the delegated channel
//!
//! A message is at most [`PACKET_SIZE`] bytes including a trailing zero
//! terminator. The reader accumulates bytes until it sees the terminator,
//! fills the buffer, or reaches end-of-stream. A full buffer without a
//! terminator keeps the first `PACKET_SIZE - 1` bytes and drops the rest.

use std::fmt;
use std::io;
use std::os::fd::BorrowedFd;

use super::sys;

/// Hard bound on one exchanged message, terminator included
pub const PACKET_SIZE: usize = 506;

/// Zero byte marking the logical end of a message
pub const TERMINATOR: u8 = 0;

/// Encode `text` for the wire: its bytes followed by the terminator
pub fn encode(text: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(text.len() + 1);
    wire.extend_from_slice(text);
    wire.push(TERMINATOR);
    wire
}

/// A complete message as received by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Message {
    /// Message content, without the terminator
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the sender's input was cut to fit the buffer
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.bytes))
    }
}

/// Result of feeding one read into the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are expected
    Pending,
    /// The message is complete
    Complete(Message),
}

/// Per-connection read state: fixed buffer plus cursor
pub struct MessageBuffer {
    buf: Box<[u8; PACKET_SIZE]>,
    cursor: usize,
    finished: bool,
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("cursor", &self.cursor)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; PACKET_SIZE]),
            cursor: 0,
            finished: false,
        }
    }

    /// Bytes received so far
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Remaining capacity, starting at the cursor
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.cursor..]
    }

    /// Record that `n` bytes were written into [`MessageBuffer::spare_mut`]
    ///
    /// `n == 0` means the peer reached end-of-stream.
    pub fn advance(&mut self, n: usize) -> Progress {
        debug_assert!(!self.finished, "advance after completion");
        debug_assert!(n <= PACKET_SIZE - self.cursor);

        self.cursor += n;
        let complete = n == 0
            || self.cursor == PACKET_SIZE
            || self.buf[self.cursor - 1] == TERMINATOR;
        if !complete {
            return Progress::Pending;
        }

        self.finished = true;
        let filled = &self.buf[..self.cursor];
        let message = match filled.last() {
            Some(&TERMINATOR) if n != 0 => Message {
                bytes: filled[..filled.len() - 1].to_vec(),
                truncated: false,
            },
            _ if self.cursor == PACKET_SIZE => Message {
                bytes: filled[..PACKET_SIZE - 1].to_vec(),
                truncated: true,
            },
            _ => Message {
                bytes: filled.to_vec(),
                truncated: false,
            },
        };
        Progress::Complete(message)
    }

    /// Mark reading as finished without a message (read failure)
    pub fn abandon(&mut self) {
        self.finished = true;
    }

    /// Read once from `fd` into the remaining capacity
    pub fn read_from(&mut self, fd: BorrowedFd<'_>) -> io::Result<Progress> {
        let n = sys::read(fd, self.spare_mut())?;
        Ok(self.advance(n))
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.finished = false;
    }
}
