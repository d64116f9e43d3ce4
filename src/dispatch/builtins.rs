//! Built-in commands available on every server.

use super::{DispatchTableBuilder, optional_str, required, required_str};
use crate::envelope::Arguments;
use crate::error::{CommandError, CommandResult, RegistrationError};
use chrono::Utc;
use serde_json::{Value, json};

pub(crate) const HELP_DESCRIPTION: &str = "List registered commands";
pub(crate) const DESCRIBE_DESCRIPTION: &str = "Describe the command named by `command`";

/// Register `echo`, `ping` and `digest`.
pub fn register(builder: &mut DispatchTableBuilder) -> Result<(), RegistrationError> {
    builder
        .register("echo", "Return the `msg` argument unchanged", echo)?
        .register(
            "ping",
            "Liveness check; echoes the optional `nonce` with the server time",
            ping,
        )?
        .register("digest", "BLAKE3 hex digest of the `data` string", digest)?;
    Ok(())
}

fn echo(args: &Arguments) -> CommandResult<Value> {
    required(args, "msg").cloned()
}

fn ping(args: &Arguments) -> CommandResult<Value> {
    let mut reply = json!({
        "pong": true,
        "time": Utc::now().to_rfc3339(),
    });
    if let Some(nonce) = optional_str(args, "nonce")? {
        reply["nonce"] = Value::String(nonce.to_string());
    }
    Ok(reply)
}

fn digest(args: &Arguments) -> CommandResult<Value> {
    let data = required_str(args, "data")?;
    let hash = blake3::hash(data.as_bytes());
    Ok(json!({
        "algorithm": "blake3",
        "digest": hash.to_hex().to_string(),
    }))
}

pub(crate) fn help(catalog: &[(String, String)]) -> Value {
    let commands: Vec<Value> = catalog
        .iter()
        .map(|(name, description)| json!({ "name": name, "description": description }))
        .collect();
    json!({
        "protocol_version": crate::PROTOCOL_VERSION,
        "version": crate::VERSION,
        "commands": commands,
    })
}

pub(crate) fn describe(catalog: &[(String, String)], args: &Arguments) -> CommandResult<Value> {
    let name = required_str(args, "command")?;
    catalog
        .iter()
        .find(|(candidate, _)| candidate == name)
        .map(|(_, description)| Value::String(description.clone()))
        .ok_or_else(|| CommandError::Failed(format!("no such command: {name}")))
}
