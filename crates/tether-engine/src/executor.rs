//! Command dispatch pipeline.
//!
//! One `execute` call runs the full pipeline: registry lookup, handler
//! validation, before-state capture, handler invocation, after-state
//! capture, diff, history, and error-pattern accounting. Failures never
//! escape as panics or errors — every invocation produces an
//! [`ExecutionResult`] whose record says what happened.
//!
//! ## Lock discipline
//!
//! The diagnostics mutex guards only the history ring and the pattern
//! table; it is taken briefly after the handler returns, never while the
//! handler runs, so status polling from other threads is not blocked by a
//! slow handler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use tether_core::observability::command_span;

use crate::command::{Command, CommandResult};
use crate::diagnostics::{
    ErrorPatternTable, ErrorSignature, ExecutionHistory, ExecutionRecord, ExecutionStats,
};
use crate::error::{Error, Result};
use crate::handler::{HandlerError, HandlerErrorKind};
use crate::metrics::EngineMetrics;
use crate::registry::CommandRegistry;
use crate::state::{ChangeSet, DetailLevel, StateProvider, StateSnapshot};

/// Tuning knobs for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Entries retained in the execution-history ring.
    pub history_limit: usize,
    /// Distinct signatures retained in the error-pattern table.
    pub pattern_limit: usize,
    /// Emit a diagnostic warning every Nth occurrence of a pattern.
    pub pattern_log_every: u64,
    /// Detail level for the before/after captures around each command.
    pub capture_detail: DetailLevel,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            pattern_limit: 256,
            pattern_log_every: 5,
            capture_detail: DetailLevel::Standard,
        }
    }
}

/// Outcome of one dispatch, with the state diff when capture was available.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// The invocation record.
    pub outcome: CommandResult,
    /// Entities the invocation touched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<ChangeSet>,
}

impl ExecutionResult {
    /// Returns true if the invocation completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Returns the failure description, if the invocation failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.outcome.error.as_deref()
    }
}

struct Diagnostics {
    history: ExecutionHistory,
    patterns: ErrorPatternTable,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("executor diagnostics lock poisoned")
}

/// Renders a panic payload into a failure message.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Validates, invokes, and records command executions.
pub struct CommandExecutor {
    registry: Arc<CommandRegistry>,
    provider: Arc<dyn StateProvider>,
    diagnostics: Mutex<Diagnostics>,
    config: ExecutorConfig,
    metrics: EngineMetrics,
}

impl CommandExecutor {
    /// Creates an executor over the given registry and state provider.
    #[must_use]
    pub fn new(
        registry: Arc<CommandRegistry>,
        provider: Arc<dyn StateProvider>,
        config: ExecutorConfig,
    ) -> Self {
        let diagnostics = Diagnostics {
            history: ExecutionHistory::new(config.history_limit),
            patterns: ErrorPatternTable::new(config.pattern_limit),
        };
        Self {
            registry,
            provider,
            diagnostics: Mutex::new(diagnostics),
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the registry handlers are registered into.
    #[must_use]
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Returns the host state provider.
    #[must_use]
    pub fn state_provider(&self) -> &Arc<dyn StateProvider> {
        &self.provider
    }

    /// Captures host state at the given detail level.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot read host state.
    pub fn capture(&self, detail: DetailLevel) -> Result<StateSnapshot> {
        self.provider.capture(detail)
    }

    /// Runs one command through the dispatch pipeline.
    ///
    /// Never panics and never returns an error for a failing command: the
    /// returned record carries the failure. Lookup and validation failures
    /// short-circuit before the handler body, so they attempt no side
    /// effects.
    pub fn execute(&self, command: &Command) -> ExecutionResult {
        match self.run_pipeline(command) {
            Ok(result) => result,
            Err(err) => {
                // Only internal invariant breakage lands here (poisoned
                // diagnostics lock, status machine misuse).
                tracing::error!(command = command.name(), error = %err, "dispatch pipeline error");
                let mut outcome = CommandResult::new(command.name());
                let _ = outcome.fail(err.to_string(), 0);
                ExecutionResult {
                    outcome,
                    diff: None,
                }
            }
        }
    }

    fn run_pipeline(&self, command: &Command) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut outcome = CommandResult::new(command.name());
        let span = command_span(command.name(), &outcome.command_id.to_string());
        let _guard = span.enter();

        // (a) lookup
        let Some(handler) = self.registry.lookup(command.name())? else {
            let err = Error::CommandNotFound {
                name: command.name().to_string(),
            };
            tracing::warn!(command = command.name(), "unknown command");
            outcome.fail(err.to_string(), elapsed_ms(started))?;
            return self.finish(outcome, None);
        };

        // (b) handler-declared validation; a rejection never reaches the
        // handler body.
        let validation = handler.validate(command.params());
        if !validation.valid {
            let err = Error::validation(command.name(), validation.errors);
            tracing::debug!(command = command.name(), error = %err, "validation rejected parameters");
            outcome.fail(err.to_string(), elapsed_ms(started))?;
            return self.finish(outcome, None);
        }

        // (c) before-state; capture failure downgrades to a missing diff.
        let before = match self.provider.capture(self.config.capture_detail) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(command = command.name(), error = %err, "before-state capture failed");
                None
            }
        };

        // (d) handler invocation; a panic is contained here and classified
        // like any other handler failure.
        outcome.start()?;
        let invocation = catch_unwind(AssertUnwindSafe(|| handler.execute(command.params())))
            .unwrap_or_else(|payload| {
                Err(HandlerError::new(
                    HandlerErrorKind::Panic,
                    panic_message(payload.as_ref()),
                ))
            });

        // (e)+(f) after-state and diff; computed on failure too, since the
        // handler may have mutated state before raising.
        let diff = before.and_then(|before| {
            match self.provider.capture(self.config.capture_detail) {
                Ok(after) => Some(self.provider.diff(&before, &after)),
                Err(err) => {
                    tracing::warn!(command = command.name(), error = %err, "after-state capture failed");
                    None
                }
            }
        });

        let elapsed = elapsed_ms(started);
        match invocation {
            Ok(value) => {
                outcome.complete(value, elapsed)?;
            }
            Err(handler_err) => {
                let err = Error::Handler {
                    command: command.name().to_string(),
                    kind: handler_err.kind.as_label().to_string(),
                    message: handler_err.message.clone(),
                };
                outcome.fail(err.to_string(), elapsed)?;
                self.learn_pattern(command.name(), &handler_err)?;
            }
        }

        self.finish(outcome, diff)
    }

    /// (h) classify the failure and count it, warning every Nth occurrence
    /// of the same signature.
    fn learn_pattern(&self, command_name: &str, err: &HandlerError) -> Result<()> {
        let signature = ErrorSignature::new(err.kind.as_label(), &err.message);
        let rendered = signature.to_string();
        let count = {
            let mut diagnostics = self.diagnostics.lock().map_err(poison_err)?;
            diagnostics.patterns.record(signature, command_name)
        };
        self.metrics.record_error_pattern(err.kind.as_label());

        if count % self.config.pattern_log_every == 0 {
            tracing::warn!(
                command = command_name,
                signature = %rendered,
                count,
                "recurring command failure"
            );
        }
        Ok(())
    }

    /// (g) append the invocation to the bounded history ring.
    fn finish(&self, outcome: CommandResult, diff: Option<ChangeSet>) -> Result<ExecutionResult> {
        let record = ExecutionRecord {
            command_id: outcome.command_id,
            command_name: outcome.command_name.clone(),
            success: outcome.is_success(),
            error: outcome.error.clone(),
            execution_time_ms: outcome.execution_time_ms,
            executed_at: outcome.updated_at,
            changes: diff.clone(),
        };
        {
            let mut diagnostics = self.diagnostics.lock().map_err(poison_err)?;
            diagnostics.history.push(record);
        }

        self.metrics.observe_command_duration(
            &outcome.command_name,
            outcome.status.as_label(),
            std::time::Duration::from_millis(outcome.execution_time_ms),
        );
        Ok(ExecutionResult { outcome, diff })
    }

    /// Returns aggregate statistics over the retained history window.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn stats(&self) -> Result<ExecutionStats> {
        let diagnostics = self.diagnostics.lock().map_err(poison_err)?;
        Ok(ExecutionStats::compute(
            &diagnostics.history,
            &diagnostics.patterns,
        ))
    }

    /// Returns up to `limit` most recent execution records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let diagnostics = self.diagnostics.lock().map_err(poison_err)?;
        Ok(diagnostics.history.recent(limit))
    }

    /// Returns every tracked error pattern, most frequent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn error_patterns(&self) -> Result<Vec<crate::diagnostics::ErrorPattern>> {
        let diagnostics = self.diagnostics.lock().map_err(poison_err)?;
        Ok(diagnostics.patterns.snapshot())
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
