//! Command invocations and their per-invocation result records.
//!
//! This module provides:
//! - `Command`: A tagged invocation validated at construction
//! - `CommandStatus`: The monotonic status machine for one invocation
//! - `CommandResult`: The record of one pass through the dispatch pipeline
//!
//! A `CommandResult` is owned by whichever container produced it (a task or
//! a transaction); containers receive their own record and never share one
//! by reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::CommandId;

use crate::error::{Error, Result};

/// A single command invocation.
///
/// Commands are tagged at construction rather than carried as loose
/// dictionaries, so an unknown shape is rejected before it reaches the
/// dispatch pipeline. Plugin-contributed commands carry the owning plugin's
/// identifier for attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Command {
    /// A command served by a built-in handler.
    #[serde(rename_all = "camelCase")]
    Standard {
        /// Registered handler name.
        name: String,
        /// Handler parameters.
        params: Value,
    },
    /// A command contributed by a plugin.
    #[serde(rename_all = "camelCase")]
    Plugin {
        /// Registered handler name.
        name: String,
        /// Handler parameters.
        params: Value,
        /// Identifier of the plugin that registered the handler.
        plugin_id: String,
    },
}

impl Command {
    /// Creates a standard command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the name is empty.
    pub fn standard(name: impl Into<String>, params: Value) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_payload("command name must not be empty"));
        }
        Ok(Self::Standard { name, params })
    }

    /// Creates a plugin command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if the name or plugin id is empty.
    pub fn plugin(
        name: impl Into<String>,
        params: Value,
        plugin_id: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let plugin_id = plugin_id.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_payload("command name must not be empty"));
        }
        if plugin_id.trim().is_empty() {
            return Err(Error::invalid_payload("plugin id must not be empty"));
        }
        Ok(Self::Plugin {
            name,
            params,
            plugin_id,
        })
    }

    /// Returns the command's registered handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Standard { name, .. } | Self::Plugin { name, .. } => name,
        }
    }

    /// Returns the command's parameters.
    #[must_use]
    pub fn params(&self) -> &Value {
        match self {
            Self::Standard { params, .. } | Self::Plugin { params, .. } => params,
        }
    }

    /// Returns the owning plugin id, if this is a plugin command.
    #[must_use]
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Standard { .. } => None,
            Self::Plugin { plugin_id, .. } => Some(plugin_id),
        }
    }

    /// Re-checks construction invariants on a deserialized command.
    ///
    /// Wire input bypasses the typed constructors, so payload parsing calls
    /// this before dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPayload`] if a name or plugin id is empty.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(Error::invalid_payload("command name must not be empty"));
        }
        if let Some(plugin_id) = self.plugin_id() {
            if plugin_id.trim().is_empty() {
                return Err(Error::invalid_payload("plugin id must not be empty"));
            }
        }
        Ok(())
    }
}

/// Status of a single command invocation.
///
/// Statuses are monotonic: once a terminal status is reached, the record
/// never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Record created, dispatch has not started the handler yet.
    Pending,
    /// Handler is executing.
    Running,
    /// Handler completed successfully.
    Completed,
    /// Lookup, validation, or the handler itself failed.
    Failed,
    /// The invocation was abandoned before the handler ran.
    Cancelled,
}

impl CommandStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => matches!(target, Self::Completed | Self::Failed | Self::Cancelled),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for CommandStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Record of one pass through the dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Unique identifier for this invocation.
    pub command_id: CommandId,
    /// The command's registered handler name.
    pub command_name: String,
    /// Current invocation status.
    pub status: CommandStatus,
    /// Handler return value. Set iff status is `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description. Set iff status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock handler duration in milliseconds.
    #[serde(default)]
    pub execution_time_ms: u64,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed status.
    pub updated_at: DateTime<Utc>,
}

impl CommandResult {
    /// Creates a new pending record for the named command.
    #[must_use]
    pub fn new(command_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            command_id: CommandId::generate(),
            command_name: command_name.into(),
            status: CommandStatus::Pending,
            result: None,
            error: None,
            execution_time_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the invocation completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    /// Marks the handler as running.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is not pending.
    pub fn start(&mut self) -> Result<()> {
        self.transition_to(CommandStatus::Running)
    }

    /// Records a successful handler return.
    ///
    /// # Errors
    ///
    /// Returns an error if the record already reached a terminal status.
    pub fn complete(&mut self, result: Value, execution_time_ms: u64) -> Result<()> {
        self.transition_to(CommandStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.execution_time_ms = execution_time_ms;
        Ok(())
    }

    /// Records a failure from lookup, validation, or the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the record already reached a terminal status.
    pub fn fail(&mut self, error: impl Into<String>, execution_time_ms: u64) -> Result<()> {
        self.transition_to(CommandStatus::Failed)?;
        self.error = Some(error.into());
        self.result = None;
        self.execution_time_ms = execution_time_ms;
        Ok(())
    }

    /// Marks an invocation that was abandoned before its handler ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the record already reached a terminal status.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition_to(CommandStatus::Cancelled)
    }

    fn transition_to(&mut self, target: CommandStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("command result for '{}' is monotonic", self.command_name),
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_command_accessors() {
        let cmd = Command::standard("create_object", json!({"type": "cube"})).unwrap();
        assert_eq!(cmd.name(), "create_object");
        assert_eq!(cmd.params()["type"], "cube");
        assert!(cmd.plugin_id().is_none());
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(Command::standard("", json!({})).is_err());
        assert!(Command::standard("   ", json!({})).is_err());
        assert!(Command::plugin("x", json!({}), "").is_err());
    }

    #[test]
    fn command_wire_roundtrip() {
        let cmd = Command::plugin("bend_mesh", json!({"angle": 45}), "mesh-tools").unwrap();
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "plugin");
        assert_eq!(json["pluginId"], "mesh-tools");

        let parsed: Command = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.name(), "bend_mesh");
        assert_eq!(parsed.plugin_id(), Some("mesh-tools"));
    }

    #[test]
    fn deserialized_empty_name_fails_ensure_valid() {
        let parsed: Command =
            serde_json::from_value(json!({"kind": "standard", "name": "", "params": {}})).unwrap();
        assert!(parsed.ensure_valid().is_err());
    }

    #[test]
    fn status_transitions() {
        let status = CommandStatus::Pending;
        assert!(status.can_transition_to(CommandStatus::Running));
        assert!(status.can_transition_to(CommandStatus::Failed));
        assert!(!status.can_transition_to(CommandStatus::Completed));

        let status = CommandStatus::Running;
        assert!(status.can_transition_to(CommandStatus::Completed));
        assert!(status.can_transition_to(CommandStatus::Failed));

        assert!(!CommandStatus::Completed.can_transition_to(CommandStatus::Running));
        assert!(!CommandStatus::Failed.can_transition_to(CommandStatus::Pending));
    }

    #[test]
    fn result_lifecycle_success() {
        let mut record = CommandResult::new("create_object");
        record.start().unwrap();
        record.complete(json!({"objectName": "Cube"}), 12).unwrap();

        assert!(record.is_success());
        assert_eq!(record.execution_time_ms, 12);
        assert!(record.result.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn result_is_monotonic_after_failure() {
        let mut record = CommandResult::new("create_object");
        record.start().unwrap();
        record.fail("no scene", 3).unwrap();

        assert!(record.complete(json!({}), 1).is_err());
        assert!(record.start().is_err());
        assert_eq!(record.status, CommandStatus::Failed);
    }

    #[test]
    fn pending_record_can_fail_directly() {
        // Lookup and validation failures never start the handler.
        let mut record = CommandResult::new("missing");
        record.fail("command not found", 0).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
    }
}
