//! Socket and configuration paths
//!
//! The rendezvous socket lives at a fixed well-known path, `/tmp/os-net/socket-0`,
//! unless overridden on the command line or in the config file.

use std::io;
use std::path::{Path, PathBuf};

/// Directory holding the rendezvous socket
const SOCKET_DIR: &str = "/tmp/os-net";

/// File name of the rendezvous socket inside [`SOCKET_DIR`]
const SOCKET_FILE: &str = "socket-0";

/// Name used for config and data directories
const APP_NAME: &str = "pipe-handoff";

/// Default path of the rendezvous socket
pub fn socket_path() -> PathBuf {
    PathBuf::from(SOCKET_DIR).join(SOCKET_FILE)
}

/// Ensure the socket's parent directory exists
///
/// Creates the directory with mode 0700 (owner only) when absent. An
/// existing directory is left as is.
pub fn ensure_socket_dir(socket: &Path) -> io::Result<PathBuf> {
    let dir = socket.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "Invalid socket path")
    })?;

    if dir.as_os_str().is_empty() {
        return Ok(PathBuf::from("."));
    }

    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
    {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    Ok(dir.to_path_buf())
}

/// Remove a stale socket binding if one exists
pub fn remove_socket(socket: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/pipe-handoff/`
/// - macOS: `~/Library/Application Support/pipe-handoff/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().join("logs"))
}
