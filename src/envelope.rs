//! Wire data model for the NDJSON protocol.
//!
//! One request or response is a single JSON document on its own line. This
//! module only deals with the document bytes; framing (the trailing newline)
//! belongs to the transport in [`crate::service`].

use crate::error::{DecodeError, ServiceError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named command arguments. Keys serialize in sorted order.
pub type Arguments = BTreeMap<String, Value>;

/// Decoded request: which command to run and with what arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Optional correlation id, echoed back in the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,

    /// Name of the command to dispatch
    pub command_name: String,

    /// Named arguments passed to the command action
    pub arguments: Arguments,
}

impl CommandEnvelope {
    /// Create an envelope without a correlation id.
    pub fn new(command_name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            command_id: None,
            command_name: command_name.into(),
            arguments,
        }
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, command_id: u64) -> Self {
        self.command_id = Some(command_id);
        self
    }
}

/// Response to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id copied from the request, if it carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,

    /// Either a `result` or an `error` field, never both
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Body of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Success payload produced by the command
    Result(Value),
    /// Human-readable failure description
    Error(String),
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn success(command_id: Option<u64>, result: Value) -> Self {
        Self {
            command_id,
            outcome: Outcome::Result(result),
        }
    }

    /// Error response carrying a message for the peer.
    pub fn failure(command_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            command_id,
            outcome: Outcome::Error(message.into()),
        }
    }

    /// Error response built from a service error.
    pub fn from_error(command_id: Option<u64>, error: &ServiceError) -> Self {
        Self::failure(command_id, error.to_string())
    }

    /// Whether this response carries an error.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Convert into a standard result.
    pub fn into_result(self) -> Result<Value, String> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(message) => Err(message),
        }
    }
}

/// Decode a request frame (without its trailing newline).
///
/// Bytes that are not a JSON document yield [`DecodeError::Malformed`]; a JSON
/// document with missing or mistyped fields, or an empty command name, yields
/// [`DecodeError::Invalid`].
pub fn decode_request(frame: &[u8]) -> Result<CommandEnvelope, DecodeError> {
    let envelope: CommandEnvelope = serde_json::from_slice(frame).map_err(|err| {
        if err.is_data() {
            DecodeError::Invalid(err.to_string())
        } else {
            DecodeError::Malformed(err)
        }
    })?;

    if envelope.command_name.trim().is_empty() {
        return Err(DecodeError::Invalid(
            "command_name must not be empty".to_string(),
        ));
    }

    Ok(envelope)
}

/// Encode a request document.
pub fn encode_request(envelope: &CommandEnvelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(envelope)
}

/// Encode a response document.
pub fn encode_response(envelope: &ResponseEnvelope) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(envelope)
}

/// Decode a response document.
pub fn decode_response(frame: &[u8]) -> serde_json::Result<ResponseEnvelope> {
    serde_json::from_slice(frame)
}
