//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::paths::{self, config_path};
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Rendezvous socket settings
    #[serde(default)]
    pub socket: SocketConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Rendezvous socket settings
#[derive(Debug, Deserialize)]
pub struct SocketConfig {
    /// Path clients connect to
    #[serde(default = "paths::socket_path")]
    pub path: PathBuf,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: paths::socket_path(),
        }
    }
}

/// Server settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen backlog for pending connections
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Upper bound on concurrently tracked connections.
    /// The OS open-descriptor limit applies regardless.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            max_connections: None,
        }
    }
}

fn default_backlog() -> i32 {
    2048
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;

        if config.server.backlog <= 0 {
            return Err(super::Error::Config(format!(
                "server.backlog must be positive, got {}",
                config.server.backlog
            )));
        }
        if config.server.max_connections == Some(0) {
            return Err(super::Error::Config(
                "server.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Apply a command-line socket override
    pub fn with_socket(mut self, socket: Option<PathBuf>) -> Self {
        if let Some(path) = socket {
            self.socket.path = path;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.socket.path, PathBuf::from("/tmp/os-net/socket-0"));
        assert_eq!(config.server.backlog, 2048);
        assert!(config.server.max_connections.is_none());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse("[server]\nmax_connections = 8\n").unwrap();
        assert_eq!(config.server.max_connections, Some(8));
        assert_eq!(config.server.backlog, 2048);
        assert_eq!(config.socket.path, paths::socket_path());
    }

    #[test]
    fn test_parse_socket_path() {
        let config = Config::parse("[socket]\npath = \"/run/handoff/sock\"\n").unwrap();
        assert_eq!(config.socket.path, PathBuf::from("/run/handoff/sock"));
    }

    #[test]
    fn test_parse_rejects_zero_capacity() {
        let err = Config::parse("[server]\nmax_connections = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_rejects_bad_toml() {
        let err = Config::parse("[server\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_cli_override_wins() {
        let config = Config::parse("[socket]\npath = \"/a\"\n")
            .unwrap()
            .with_socket(Some(PathBuf::from("/b")));
        assert_eq!(config.socket.path, PathBuf::from("/b"));
    }
}
