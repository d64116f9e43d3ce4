//! Server configuration
//!
//! Defaults cover local development. A JSON file can override any subset of
//! fields; command-line flags are applied on top by the daemon.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the Courier server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on (default: 127.0.0.1:7878)
    pub listen: String,

    /// Maximum number of connections served at once
    pub max_connections: usize,

    /// Maximum size of one request line in bytes, excluding the newline
    pub max_frame_bytes: usize,

    /// Close a connection after this many idle seconds (disabled when unset)
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
            max_connections: 256,
            max_frame_bytes: 1024 * 1024,
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Load a configuration file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_bytes must be at least 1".into(),
            ));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "idle_timeout_secs must be positive; omit it to disable".into(),
            ));
        }
        Ok(())
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
