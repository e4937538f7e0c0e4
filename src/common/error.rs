//! Error types for the handoff server and client
//!
//! Fatal errors (startup, bind, readiness wait, descriptor transfer) are
//! propagated to `main`. Per-connection faults are handled inside the
//! server loop and only surface here when a caller asks for them.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the handoff crate
#[derive(Error, Debug)]
pub enum Error {
    // === Startup / Resource Errors ===
    #[error("Failed to allocate {what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Socket path too long ({len} bytes, limit {max}): {path}")]
    PathTooLong { path: String, len: usize, max: usize },

    // === Descriptor Transfer Errors ===
    #[error("Descriptor transfer failed: {0}")]
    Transfer(String),

    // === Slot Table Errors ===
    #[error("No free connection slot (capacity {capacity})")]
    NoCapacity { capacity: usize },

    // === Event Loop Errors ===
    #[error("Readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Invalid request, descriptor not open")]
    InvalidDescriptor,

    #[error("Error condition reported on descriptor")]
    ErrorCondition,

    // === Client Errors ===
    #[error("Server not running. Start it with 'handoff server'")]
    ServerNotRunning,

    #[error("Failed to connect to server: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("Server closed the connection before handing off a channel")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    Send(#[source] io::Error),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a resource error from the last OS error
    pub fn resource(what: &'static str) -> Self {
        Self::Resource {
            what,
            source: io::Error::last_os_error(),
        }
    }

    /// Create a transfer error from the last OS error
    pub fn transfer(call: &str) -> Self {
        Self::Transfer(format!("{} failed: {}", call, io::Error::last_os_error()))
    }
}
