//! Pipe handoff over a local socket
//!
//! A server accepts connections on a well-known Unix domain socket and hands
//! every client the write end of a private pipe as an `SCM_RIGHTS`
//! descriptor. The client writes one bounded message into the pipe and exits.

pub mod cli;
pub mod commands;
pub mod common;
pub mod ipc;
pub mod server;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use ipc::message::{Message, PACKET_SIZE};
pub use server::{Server, ServerEvent};
