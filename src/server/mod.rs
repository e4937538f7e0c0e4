//! Server mode - rendezvous socket and connection event loop
//!
//! The server:
//! 1. Binds the well-known rendezvous socket
//! 2. Accepts clients and hands each one the write end of a private pipe
//! 3. Reads one message per pipe and prints it
//! 4. Frees the connection slot and keeps serving

pub mod connection;
pub mod event_loop;
pub mod slots;

pub use event_loop::{CloseReason, Server, ServerEvent};

use crate::common::{config::Config, Result};

/// Run in server mode until a fatal error
pub fn run(config: &Config) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Starting handoff server"
    );

    let server = Server::bind(config)?;
    println!("listening");
    server.run()
}
