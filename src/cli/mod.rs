//! CLI command handling
//!
//! Dispatches a parsed command to server or client mode.

use std::path::PathBuf;

use crate::commands::Commands;
use crate::common::{config::Config, logging, Result};
use crate::{ipc, server};

/// Dispatch a CLI command
///
/// `socket` overrides the rendezvous path from the config file.
pub fn dispatch(command: Commands, socket: Option<PathBuf>) -> Result<()> {
    match command {
        Commands::Server => {
            if let Some(log_file) = logging::init_server() {
                tracing::debug!(log = %log_file.display(), "Logging to file");
            }
            let config = Config::load()?.with_socket(socket);
            server::run(&config)
        }

        Commands::Client { message } => {
            logging::init_cli();
            let config = Config::load()?.with_socket(socket);

            let sent = ipc::client::send(&config.socket.path, message.as_bytes())?;
            tracing::debug!(bytes = sent, "Exchange complete");
            println!("sent: '{}'", message);

            Ok(())
        }
    }
}
