//! Error types for the Courier service
//!
//! Domain errors use thiserror. Errors in the decode, validation and dispatch
//! categories are reported back to the peer as text; transport errors are only
//! logged and end the affected connection.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to turn a frame into a [`CommandEnvelope`](crate::envelope::CommandEnvelope).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a JSON document (syntax error, truncation, bad UTF-8).
    #[error("malformed request")]
    Malformed(#[source] serde_json::Error),

    /// The frame is JSON but required fields are missing or mistyped.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Failure raised by a command action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// A required argument was not supplied
    #[error("missing argument: {0}")]
    MissingArgument(String),

    /// An argument was supplied with the wrong type
    #[error("invalid argument '{name}': expected {expected}")]
    InvalidArgument {
        /// Argument name
        name: String,
        /// Description of the expected type
        expected: &'static str,
    },

    /// The action ran but could not complete
    #[error("{0}")]
    Failed(String),
}

/// Convenience result alias for command actions
pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Failure to dispatch an envelope through the table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No action is registered under this name
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The action returned an error
    #[error("{command}: {source}")]
    Command {
        /// Command name
        command: String,
        /// Error raised by the action
        source: CommandError,
    },

    /// The action panicked
    #[error("{0}: command panicked")]
    Panicked(String),
}

/// Failure while populating the dispatch table at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Command names must be non-empty
    #[error("command name must not be empty")]
    EmptyName,

    /// A command with this name was already registered
    #[error("command '{0}' is already registered")]
    Duplicate(String),
}

/// Error reported to the peer for a single request.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Frame could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Dispatch failed
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Frame exceeded the configured size limit
    #[error("request too large")]
    FrameTooLarge,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path of the config file
        path: PathBuf,
        /// Underlying IO error
        source: io::Error,
    },

    /// Config file is not valid JSON for [`ServerConfig`](crate::config::ServerConfig)
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path of the config file
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// A config value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Listener-level errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying IO error
        source: io::Error,
    },

    /// Configuration rejected at startup
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error outside of a single connection
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type using ServerError
pub type Result<T> = std::result::Result<T, ServerError>;
