//! Courier – a newline-delimited JSON command dispatch service
//!
//! This crate implements a small request/response protocol over a stream
//! transport:
//! - Command envelopes carrying a command name, named arguments and an
//!   optional correlation id
//! - A read-only dispatch table populated once at startup
//! - A per-connection handler that answers every request with exactly one
//!   response, in order
//! - A TCP listener that runs one task per connection behind a concurrency
//!   limit, plus a stdio transport for embedding

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Blocking NDJSON client
pub mod client;
/// Server configuration
pub mod config;
/// Command dispatch table and built-in commands
pub mod dispatch;
/// Wire data model and codec
pub mod envelope;
/// Error types
pub mod error;
/// TCP listener and connection registry
pub mod server;
/// Per-connection request/response handler
pub mod service;

// Re-export key types for convenience
pub use config::ServerConfig;
pub use dispatch::DispatchTable;
pub use envelope::{CommandEnvelope, ResponseEnvelope};
pub use server::Server;
pub use service::Service;

/// Current version of the Courier crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version reported by the `help` command
pub const PROTOCOL_VERSION: &str = "1.0.0";
