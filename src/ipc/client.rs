//! Client side of the handoff exchange
//!
//! Drives one connection through `Connecting → AwaitingFd → Sending → Done`:
//! connect to the rendezvous socket, receive the delegated pipe end, write
//! the message into it and close it.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use crate::common::{Error, Result};

use super::endpoint::{ConnectStatus, Endpoint};
use super::fd_transfer::{FdTransfer, ScmRights};
use super::message::{self, PACKET_SIZE};
use super::poll::{Interest, PollSet, Readiness};
use super::sys;

/// Where an exchange currently stands
#[derive(Debug)]
pub enum ExchangeState {
    /// Waiting for the non-blocking connect to complete
    Connecting,
    /// Connected, waiting for the server to hand over a channel
    AwaitingFd,
    /// Writing the message into the delegated channel
    Sending { channel: OwnedFd, sent: usize },
    /// Message fully written and channel closed
    Done,
}

/// One client exchange over a rendezvous endpoint
#[derive(Debug)]
pub struct Exchange<T: FdTransfer = ScmRights> {
    endpoint: Endpoint,
    wire: Vec<u8>,
    state: ExchangeState,
    transfer: T,
}

impl Exchange<ScmRights> {
    /// Prepare an exchange sending `message` (the terminator is added here)
    pub fn new(endpoint: Endpoint, message: &[u8]) -> Self {
        Self::with_transfer(endpoint, message, ScmRights)
    }
}

impl<T: FdTransfer> Exchange<T> {
    /// Like [`Exchange::new`] with a custom descriptor transfer
    ///
    /// At most [`PACKET_SIZE`] bytes go on the wire. The server reads no
    /// further, so a longer input loses its tail and its terminator.
    pub fn with_transfer(endpoint: Endpoint, message: &[u8], transfer: T) -> Self {
        let mut wire = message::encode(message);
        if wire.len() > PACKET_SIZE {
            tracing::warn!(
                len = message.len(),
                limit = PACKET_SIZE,
                "Message too long, sending the first {} bytes",
                PACKET_SIZE
            );
            wire.truncate(PACKET_SIZE);
        }
        Self {
            endpoint,
            wire,
            state: ExchangeState::Connecting,
            transfer,
        }
    }

    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Run the exchange to completion
    ///
    /// Returns the number of bytes written, terminator included when it fit.
    pub fn run(mut self) -> Result<usize> {
        self.connect()?;

        let mut set = PollSet::new();
        loop {
            let interest = match &self.state {
                ExchangeState::Connecting => (self.endpoint.as_fd(), Interest::Writable),
                ExchangeState::AwaitingFd => (self.endpoint.as_fd(), Interest::Readable),
                ExchangeState::Sending { channel, .. } => (channel.as_fd(), Interest::Writable),
                ExchangeState::Done => return Ok(self.wire.len()),
            };

            set.clear();
            let idx = set.push(interest.0, interest.1);
            set.wait(None).map_err(Error::Poll)?;
            let ready = set.readiness(idx);

            self.step(ready)?;
        }
    }

    fn connect(&mut self) -> Result<()> {
        match self.endpoint.connect() {
            Ok(ConnectStatus::Connected) => {
                tracing::debug!(path = %self.endpoint.path().display(), "Connected");
                self.state = ExchangeState::AwaitingFd;
                Ok(())
            }
            Ok(ConnectStatus::InProgress) => {
                tracing::debug!("Waiting for connect completion");
                self.state = ExchangeState::Connecting;
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::ConnectionRefused =>
            {
                Err(Error::ServerNotRunning)
            }
            Err(e) => Err(Error::ConnectFailed(e)),
        }
    }

    /// Advance the state machine on one readiness report
    fn step(&mut self, ready: Readiness) -> Result<()> {
        if ready.is_invalid() {
            return Err(Error::InvalidDescriptor);
        }
        if ready.is_error() {
            return Err(Error::ErrorCondition);
        }

        match &mut self.state {
            ExchangeState::Connecting => {
                if ready.is_writable() {
                    if let Some(e) = self.endpoint.take_error()? {
                        return Err(Error::ConnectFailed(e));
                    }
                    tracing::debug!("Connected");
                    self.state = ExchangeState::AwaitingFd;
                }
            }
            ExchangeState::AwaitingFd => {
                if ready.is_readable() {
                    // The handoff can be queued behind a hang-up.
                    let channel = match self.transfer.receive_descriptor(self.endpoint.as_fd()) {
                        Ok(channel) => channel,
                        Err(_) if ready.is_hangup() => return Err(Error::ConnectionClosed),
                        Err(e) => return Err(e),
                    };
                    tracing::debug!("Received writing end of pipe");
                    self.state = ExchangeState::Sending { channel, sent: 0 };
                } else if ready.is_hangup() {
                    return Err(Error::ConnectionClosed);
                }
            }
            ExchangeState::Sending { channel, sent } => {
                if ready.is_writable() {
                    match sys::write(channel.as_fd(), &self.wire[*sent..]) {
                        Ok(n) => *sent += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(Error::Send(e)),
                    }
                    if *sent == self.wire.len() {
                        tracing::debug!(bytes = *sent, "Message sent, closing channel");
                        // Dropping the state closes the channel.
                        self.state = ExchangeState::Done;
                    }
                }
            }
            ExchangeState::Done => {}
        }
        Ok(())
    }
}

/// Connect to the server at `path` and send `message`
pub fn send(path: &Path, message: &[u8]) -> Result<usize> {
    let endpoint = Endpoint::create(path)?;
    Exchange::new(endpoint, message).run()
}
