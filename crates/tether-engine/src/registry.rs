//! Name-to-handler registration and lookup.
//!
//! The registry holds no execution logic: it maps command names to handler
//! instances plus introspection metadata. Registration never overwrites —
//! a duplicate name warns and keeps the existing handler, so domain logic
//! cannot be silently shadowed by a later plugin.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::handler::CommandHandler;

/// Introspection metadata for a registered command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    /// Registered command name.
    pub name: String,
    /// Handler-provided description.
    pub description: String,
    /// Owning plugin, when the command was plugin-contributed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    /// When the handler was registered.
    pub registered_at: DateTime<Utc>,
    /// Handler-provided parameter schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

struct RegisteredCommand {
    handler: Arc<dyn CommandHandler>,
    metadata: CommandMetadata,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("command registry lock poisoned")
}

/// Name→handler map with registration and lookup.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, RegisteredCommand>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under the given name.
    ///
    /// Returns false (and warns) without overwriting when the name is
    /// already taken.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool> {
        self.register_inner(name.into(), handler, None)
    }

    /// Registers a plugin-contributed handler.
    ///
    /// Same duplicate policy as [`CommandRegistry::register`]; the plugin id
    /// is recorded in the command's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register_plugin(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        plugin_id: impl Into<String>,
    ) -> Result<bool> {
        self.register_inner(name.into(), handler, Some(plugin_id.into()))
    }

    fn register_inner(
        &self,
        name: String,
        handler: Arc<dyn CommandHandler>,
        plugin_id: Option<String>,
    ) -> Result<bool> {
        let mut commands = self.commands.write().map_err(poison_err)?;
        if commands.contains_key(&name) {
            tracing::warn!(command = %name, "command already registered; keeping existing handler");
            return Ok(false);
        }

        let metadata = CommandMetadata {
            name: name.clone(),
            description: handler.describe().to_string(),
            plugin_id,
            registered_at: Utc::now(),
            schema: handler.schema(),
        };
        commands.insert(name.clone(), RegisteredCommand { handler, metadata });
        drop(commands);

        tracing::debug!(command = %name, "registered command");
        Ok(true)
    }

    /// Removes a handler by name.
    ///
    /// Returns false if no handler was registered under the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn unregister(&self, name: &str) -> Result<bool> {
        let mut commands = self.commands.write().map_err(poison_err)?;
        let removed = commands.remove(name).is_some();
        drop(commands);
        if removed {
            tracing::debug!(command = %name, "unregistered command");
        }
        Ok(removed)
    }

    /// Looks up a handler by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<dyn CommandHandler>>> {
        let commands = self.commands.read().map_err(poison_err)?;
        Ok(commands.get(name).map(|entry| Arc::clone(&entry.handler)))
    }

    /// Returns true if a handler is registered under the name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn contains(&self, name: &str) -> Result<bool> {
        let commands = self.commands.read().map_err(poison_err)?;
        Ok(commands.contains_key(name))
    }

    /// Lists metadata for every registered command, sorted by name.
    ///
    /// Used by schema/documentation generation in the wire layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn list(&self) -> Result<Vec<CommandMetadata>> {
        let commands = self.commands.read().map_err(poison_err)?;
        let mut listing: Vec<_> = commands
            .values()
            .map(|entry| entry.metadata.clone())
            .collect();
        drop(commands);
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Returns the number of registered commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let commands = self.commands.read().map_err(poison_err)?;
        Ok(commands.len())
    }

    /// Returns true if no commands are registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.len().unwrap_or(0);
        f.debug_struct("CommandRegistry")
            .field("commands", &count)
            .finish()
    }
}
