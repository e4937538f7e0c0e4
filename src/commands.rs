//! CLI command definitions
//!
//! Defines the clap commands for the handoff CLI.

use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Listen on the rendezvous socket and print every message received
    Server,

    /// Send one message to a running server
    Client {
        /// Message to send (at most 505 bytes are delivered)
        message: String,
    },
}
