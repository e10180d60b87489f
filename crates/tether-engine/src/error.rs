//! Error types for the engine domain.
//!
//! The taxonomy separates errors by where they surface:
//!
//! - Submission-time: [`Error::QueueFull`], [`Error::InvalidPayload`]
//! - Dispatch-time: [`Error::CommandNotFound`], [`Error::Validation`],
//!   [`Error::Handler`]
//! - Transaction lifecycle: [`Error::TransactionSealed`],
//!   [`Error::TransactionAlreadyExecuted`], [`Error::EmptyTransaction`],
//!   [`Error::RestoreFailed`]
//!
//! A timed-out `wait` is not an error: it is expressed as `Ok(None)` so
//! callers can tell "still running" apart from "failed".

use tether_core::{TaskId, TransactionId};

/// The result type used throughout tether-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task queue is at capacity; the caller may retry or drop.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull {
        /// The configured queue capacity.
        capacity: usize,
    },

    /// No handler is registered under the requested command name.
    #[error("command not found: {name}")]
    CommandNotFound {
        /// The command name that was looked up.
        name: String,
    },

    /// Handler-declared parameter validation rejected the input.
    ///
    /// The handler body was never invoked; no side effects were attempted.
    #[error("validation failed for '{command}': {}", errors.join("; "))]
    Validation {
        /// The command whose parameters were rejected.
        command: String,
        /// The individual validation failures.
        errors: Vec<String>,
    },

    /// A handler raised after attempting side effects.
    ///
    /// Host state may be partially mutated; no automatic repair happens at
    /// this layer.
    #[error("handler error in '{command}': {kind}: {message}")]
    Handler {
        /// The command whose handler failed.
        command: String,
        /// Stable classification label for the failure.
        kind: String,
        /// Human-readable failure message.
        message: String,
    },

    /// A task was not found in the queue's task table.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was looked up.
        task_id: TaskId,
    },

    /// A transaction was not found in the store.
    #[error("transaction not found: {transaction_id}")]
    TransactionNotFound {
        /// The transaction ID that was looked up.
        transaction_id: TransactionId,
    },

    /// Commands may only be appended while a transaction is still open.
    #[error("transaction {transaction_id} is {state}; commands can no longer be added")]
    TransactionSealed {
        /// The transaction that rejected the append.
        transaction_id: TransactionId,
        /// The transaction's current state.
        state: String,
    },

    /// `execute` is single-shot; a second invocation never re-runs commands.
    #[error("transaction {transaction_id} is {state} and cannot be executed again")]
    TransactionAlreadyExecuted {
        /// The transaction that rejected the re-execution.
        transaction_id: TransactionId,
        /// The transaction's current state.
        state: String,
    },

    /// A transaction with no commands was asked to execute.
    #[error("transaction {transaction_id} has no commands")]
    EmptyTransaction {
        /// The empty transaction.
        transaction_id: TransactionId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A task payload could not be interpreted for its kind.
    #[error("invalid payload: {reason}")]
    InvalidPayload {
        /// Description of the payload problem.
        reason: String,
    },

    /// The state provider failed to capture a snapshot.
    #[error("state capture failed: {message}")]
    StateCapture {
        /// Description of the capture failure.
        message: String,
    },

    /// Restoring a snapshot failed.
    ///
    /// During a transaction rollback this never replaces the original
    /// command failure as the reported cause; it is surfaced as a secondary
    /// field on the report.
    #[error("snapshot restore failed: {message}")]
    RestoreFailed {
        /// Description of the restore failure.
        message: String,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from tether-core.
    #[error("core error: {0}")]
    Core(#[from] tether_core::Error),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a validation error from a list of failures.
    #[must_use]
    pub fn validation(command: impl Into<String>, errors: Vec<String>) -> Self {
        Self::Validation {
            command: command.into(),
            errors,
        }
    }

    /// Creates an invalid-payload error.
    #[must_use]
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
