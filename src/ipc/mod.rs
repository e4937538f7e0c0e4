//! Local IPC plumbing shared by the server and the client
//!
//! The rendezvous socket is an `AF_UNIX` / `SOCK_SEQPACKET` socket. Its only
//! job is to carry one pipe write end per client as `SCM_RIGHTS` ancillary
//! data; the message itself travels over the pipe.

pub mod client;
pub mod endpoint;
pub mod fd_transfer;
pub mod message;
pub mod poll;
pub mod sys;

pub use client::Exchange;
pub use endpoint::Endpoint;
pub use fd_transfer::{FdTransfer, ScmRights};
pub use message::{Message, PACKET_SIZE};
