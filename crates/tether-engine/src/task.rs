//! Queued task records and their lifecycle.
//!
//! A task is one unit of asynchronous work: submitted from any thread,
//! claimed and executed exactly once on the host's apply thread. Status is
//! monotonic — Pending → Processing → {Completed | Failed} — and never
//! moves backward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::TaskId;

use crate::error::{Error, Result};

/// What kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    /// Execute a single command; the payload is one serialized command.
    Execute,
    /// Capture a host state snapshot; the payload names the detail level.
    GetState,
    /// Execute an ordered command list; the payload is a command array.
    ///
    /// Batches stop at the first failure and report partial results; they
    /// never roll back. Transactions are the atomic path.
    Batch,
}

impl TaskKind {
    /// Returns a lowercase label suitable for metrics and generated names.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::GetState => "get_state",
            Self::Batch => "batch",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// In the queue, not yet claimed.
    Pending,
    /// Claimed by the scheduler, executing on the apply thread.
    Processing,
    /// Executed successfully.
    Completed,
    /// Execution failed.
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Processing),
            Self::Processing => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier; callers hold only this.
    pub id: TaskId,
    /// What kind of work the payload carries.
    pub kind: TaskKind,
    /// Display name for logs and status listings.
    pub name: String,
    /// Kind-specific payload, opaque to the queue.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// When the task was submitted.
    pub created_at: DateTime<Utc>,
    /// When the scheduler claimed the task.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution result. Set iff status is `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description. Set iff status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Creates a new pending task.
    #[must_use]
    pub fn new(kind: TaskKind, payload: Value) -> Self {
        let id = TaskId::generate();
        Self {
            id,
            kind,
            name: format!("{}-{}", kind.as_label(), id.short()),
            payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Replaces the generated display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns true if the task reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the task as claimed by the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error unless the task is pending — a task is executed at
    /// most once.
    pub fn start(&mut self) -> Result<()> {
        self.transition_to(TaskStatus::Processing)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Records successful execution.
    ///
    /// # Errors
    ///
    /// Returns an error unless the task is processing.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition_to(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Records failed execution.
    ///
    /// # Errors
    ///
    /// Returns an error unless the task is processing.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition_to(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Returns wall-clock execution time once the task is terminal.
    #[must_use]
    pub fn execution_time_ms(&self) -> Option<u64> {
        let (started, completed) = (self.started_at?, self.completed_at?);
        u64::try_from((completed - started).num_milliseconds()).ok()
    }

    fn transition_to(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("task '{}' status is monotonic", self.name),
            });
        }
        self.status = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_machine_happy_path() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn status_machine_rejects_shortcuts_and_reversals() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn task_lifecycle_success() {
        let mut task = Task::new(TaskKind::Execute, json!({"name": "create_object"}));
        assert_eq!(task.status, TaskStatus::Pending);

        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.started_at.is_some());

        task.complete(json!({"objectName": "Cube"})).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.result.is_some());
        assert!(task.error.is_none());
        assert!(task.completed_at.is_some());
        assert!(task.execution_time_ms().is_some());
    }

    #[test]
    fn task_runs_at_most_once() {
        let mut task = Task::new(TaskKind::Execute, json!({}));
        task.start().unwrap();
        assert!(task.start().is_err());

        task.fail("handler blew up").unwrap();
        assert!(task.start().is_err());
        assert!(task.complete(json!({})).is_err());
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert!(task.result.is_none());
    }

    #[test]
    fn completion_requires_processing() {
        let mut task = Task::new(TaskKind::GetState, json!({}));
        assert!(task.complete(json!({})).is_err());
        assert!(task.fail("nope").is_err());
    }

    #[test]
    fn generated_name_carries_kind() {
        let task = Task::new(TaskKind::Batch, json!([]));
        assert!(task.name.starts_with("batch-"));

        let task = Task::new(TaskKind::Execute, json!({})).with_name("spawn cube");
        assert_eq!(task.name, "spawn cube");
    }
}
