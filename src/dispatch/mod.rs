//! Command dispatch table
//!
//! Commands are registered on a [`DispatchTableBuilder`] during startup. The
//! builder then produces an immutable [`DispatchTable`] that is shared by every
//! connection handler through an `Arc`; nothing mutates it afterwards, so
//! lookups need no locking.

use crate::envelope::{Arguments, CommandEnvelope};
use crate::error::{CommandError, CommandResult, DispatchError, RegistrationError};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub mod builtins;

/// Action invoked for a command: consumes the arguments, produces a result.
pub type CommandAction = Arc<dyn Fn(&Arguments) -> CommandResult<Value> + Send + Sync>;

#[derive(Clone)]
struct CommandEntry {
    description: String,
    action: CommandAction,
}

/// Collects command registrations before the table is frozen.
#[derive(Default)]
pub struct DispatchTableBuilder {
    commands: HashMap<String, CommandEntry>,
}

impl DispatchTableBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under `name`.
    pub fn register<F>(
        &mut self,
        name: &str,
        description: &str,
        action: F,
    ) -> Result<&mut Self, RegistrationError>
    where
        F: Fn(&Arguments) -> CommandResult<Value> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if self.commands.contains_key(name) {
            return Err(RegistrationError::Duplicate(name.to_string()));
        }

        self.commands.insert(
            name.to_string(),
            CommandEntry {
                description: description.to_string(),
                action: Arc::new(action),
            },
        );
        Ok(self)
    }

    /// Register the built-in utility commands (`echo`, `ping`, `digest`).
    pub fn with_builtins(mut self) -> Result<Self, RegistrationError> {
        builtins::register(&mut self)?;
        Ok(self)
    }

    /// Freeze the registrations.
    ///
    /// The introspection commands `help` and `describe` are installed here,
    /// over a snapshot of the final catalog, unless the caller registered its
    /// own commands under those names.
    pub fn build(mut self) -> Arc<DispatchTable> {
        let mut catalog: Vec<(String, String)> = self
            .commands
            .iter()
            .map(|(name, entry)| (name.clone(), entry.description.clone()))
            .collect();
        for (name, description) in [
            ("help", builtins::HELP_DESCRIPTION),
            ("describe", builtins::DESCRIBE_DESCRIPTION),
        ] {
            if !self.commands.contains_key(name) {
                catalog.push((name.to_string(), description.to_string()));
            }
        }
        catalog.sort();
        let catalog = Arc::new(catalog);

        if !self.commands.contains_key("help") {
            let listing = Arc::clone(&catalog);
            // Cannot fail: the name is non-empty and was checked above.
            let _ = self.register("help", builtins::HELP_DESCRIPTION, move |_args| {
                Ok(builtins::help(&listing))
            });
        }
        if !self.commands.contains_key("describe") {
            let listing = Arc::clone(&catalog);
            let _ = self.register("describe", builtins::DESCRIBE_DESCRIPTION, move |args| {
                builtins::describe(&listing, args)
            });
        }

        tracing::debug!(commands = self.commands.len(), "dispatch table built");
        Arc::new(DispatchTable {
            commands: self.commands,
        })
    }
}

/// Read-only mapping from command name to action.
pub struct DispatchTable {
    commands: HashMap<String, CommandEntry>,
}

impl DispatchTable {
    /// Start building a table.
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    /// Table containing the built-in commands only.
    pub fn with_builtins() -> Arc<Self> {
        let mut builder = DispatchTableBuilder::new();
        // Built-in names are fixed and distinct, so registration into an
        // empty builder cannot fail.
        let _ = builtins::register(&mut builder);
        builder.build()
    }

    /// Run the action registered for the envelope's command.
    ///
    /// Unknown names, action errors and panicking actions all come back as a
    /// [`DispatchError`]; none of them unwind into the caller.
    pub fn dispatch(&self, envelope: &CommandEnvelope) -> Result<Value, DispatchError> {
        let name = &envelope.command_name;
        let entry = self
            .commands
            .get(name)
            .ok_or_else(|| DispatchError::UnknownCommand(name.clone()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| (entry.action)(&envelope.arguments))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(DispatchError::Command {
                command: name.clone(),
                source,
            }),
            Err(_) => {
                tracing::error!(command = %name, "command action panicked");
                Err(DispatchError::Panicked(name.clone()))
            }
        }
    }

    /// Registered command names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Fetch a required argument.
pub fn required<'a>(args: &'a Arguments, name: &str) -> CommandResult<&'a Value> {
    args.get(name)
        .ok_or_else(|| CommandError::MissingArgument(name.to_string()))
}

/// Fetch a required string argument.
pub fn required_str<'a>(args: &'a Arguments, name: &str) -> CommandResult<&'a str> {
    required(args, name)?
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgument {
            name: name.to_string(),
            expected: "string",
        })
}

/// Fetch an optional string argument; present-but-mistyped is an error.
pub fn optional_str<'a>(args: &'a Arguments, name: &str) -> CommandResult<Option<&'a str>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| CommandError::InvalidArgument {
                name: name.to_string(),
                expected: "string",
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(name: &str, args: Value) -> CommandEnvelope {
        let arguments = serde_json::from_value(args).unwrap();
        CommandEnvelope::new(name, arguments)
    }

    #[test]
    fn unknown_command_is_reported() {
        let table = DispatchTable::builder().build();
        let err = table.dispatch(&envelope("nope", json!({}))).unwrap_err();
        assert_eq!(err, DispatchError::UnknownCommand("nope".into()));
        assert_eq!(err.to_string(), "unknown command: nope");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = DispatchTable::builder();
        builder.register("a", "first", |_| Ok(Value::Null)).unwrap();
        let err = builder
            .register("a", "second", |_| Ok(Value::Null))
            .err()
            .unwrap();
        assert_eq!(err, RegistrationError::Duplicate("a".into()));
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut builder = DispatchTable::builder();
        assert_eq!(
            builder.register("", "nothing", |_| Ok(Value::Null)).err(),
            Some(RegistrationError::EmptyName)
        );
    }

    #[test]
    fn action_error_is_wrapped_with_command_name() {
        let mut builder = DispatchTable::builder();
        builder
            .register("needs", "needs x", |args| {
                required_str(args, "x").map(Value::from)
            })
            .unwrap();
        let table = builder.build();

        let err = table.dispatch(&envelope("needs", json!({}))).unwrap_err();
        assert_eq!(err.to_string(), "needs: missing argument: x");

        let err = table
            .dispatch(&envelope("needs", json!({"x": 5})))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "needs: invalid argument 'x': expected string"
        );
    }

    #[test]
    fn panicking_action_is_contained() {
        let mut builder = DispatchTable::builder();
        builder
            .register("boom", "always panics", |_| panic!("boom"))
            .unwrap();
        let table = builder.build();

        let err = table.dispatch(&envelope("boom", json!({}))).unwrap_err();
        assert_eq!(err, DispatchError::Panicked("boom".into()));
        // The table is still usable afterwards.
        assert!(table.dispatch(&envelope("help", json!({}))).is_ok());
    }

    #[test]
    fn build_installs_introspection() {
        let table = DispatchTable::builder().build();
        assert_eq!(table.names(), vec!["describe", "help"]);
    }

    #[test]
    fn optional_str_handles_null() {
        let args: Arguments = serde_json::from_value(json!({"a": null, "b": "x", "c": 1})).unwrap();
        assert_eq!(optional_str(&args, "a").unwrap(), None);
        assert_eq!(optional_str(&args, "b").unwrap(), Some("x"));
        assert_eq!(optional_str(&args, "missing").unwrap(), None);
        assert!(optional_str(&args, "c").is_err());
    }
}
