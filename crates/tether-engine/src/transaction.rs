//! Transactional command batches with snapshot rollback.
//!
//! A transaction is an ordered list of commands executed as a unit through
//! the dispatch pipeline. Execution is single-shot: once a transaction has
//! run, a second attempt is rejected rather than silently re-run, because
//! re-running could duplicate side effects.
//!
//! Rollback is all-or-nothing against one snapshot taken strictly before
//! the first command. Partial progress is never partially rolled back: if
//! command three of five fails, the restore target is the pre-transaction
//! state, not the state after command two.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::observability::transaction_span;
use tether_core::TransactionId;

use crate::command::{Command, CommandResult};
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::metrics::EngineMetrics;
use crate::scheduler::ApplyGate;
use crate::state::{DetailLevel, StateSnapshot};

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Accepting commands; not yet run.
    Initialized,
    /// Commands are executing on the apply thread.
    Executing,
    /// Finished, successfully or not. Terminal.
    Executed,
}

impl TransactionState {
    /// Returns true if this is the terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Initialized => matches!(target, Self::Executing),
            Self::Executing => matches!(target, Self::Executed),
            Self::Executed => false,
        }
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        Self::Initialized
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "INITIALIZED"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Executed => write!(f, "EXECUTED"),
        }
    }
}

/// What happened to the rollback attempt after a command failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStatus {
    /// Whether a restore was attempted (a snapshot existed).
    pub attempted: bool,
    /// Whether the restore succeeded.
    pub restored: bool,
    /// Restore failure description. Secondary to the command failure that
    /// triggered the rollback — never the reported cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of executing a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReport {
    /// The transaction this report belongs to.
    pub transaction_id: TransactionId,
    /// The transaction's display name.
    pub name: String,
    /// True when every command completed successfully.
    pub success: bool,
    /// Commands that completed successfully.
    pub executed: usize,
    /// Commands the transaction held.
    pub total: usize,
    /// Wall-clock batch duration.
    pub execution_time_ms: u64,
    /// Per-command records, in execution order. A failing command's record
    /// is included; commands after it never ran and have no record.
    pub results: Vec<CommandResult>,
    /// The primary failure cause, when the batch did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Rollback outcome, when a failure triggered one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStatus>,
}

/// Point-in-time view of a transaction for status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Display name.
    pub name: String,
    /// Current lifecycle state.
    pub state: TransactionState,
    /// Commands held by the transaction.
    pub command_count: usize,
    /// Commands that completed successfully so far.
    pub executed_count: usize,
    /// When execution began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether a pre-execution snapshot is held in memory.
    pub has_snapshot: bool,
}

/// An ordered command batch with single-shot execution.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    name: String,
    state: TransactionState,
    commands: Vec<Command>,
    results: Vec<CommandResult>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    snapshot: Option<StateSnapshot>,
}

impl Transaction {
    /// Creates an empty transaction, generating a name when none is given.
    #[must_use]
    pub fn new(name: Option<String>) -> Self {
        let id = TransactionId::generate();
        Self {
            id,
            name: name.unwrap_or_else(|| format!("transaction-{}", id.short())),
            state: TransactionState::Initialized,
            commands: Vec::new(),
            results: Vec::new(),
            started_at: None,
            finished_at: None,
            snapshot: None,
        }
    }

    /// Returns the transaction's id.
    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the transaction's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transaction's lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns the number of commands held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if the transaction holds no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Appends a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionSealed`] once execution has started —
    /// commands may only be added while the transaction is `Initialized`.
    pub fn add(&mut self, command: Command) -> Result<()> {
        if self.state != TransactionState::Initialized {
            return Err(Error::TransactionSealed {
                transaction_id: self.id,
                state: self.state.to_string(),
            });
        }
        self.commands.push(command);
        Ok(())
    }

    /// Claims the transaction for execution, returning the command list.
    ///
    /// # Errors
    ///
    /// Rejects empty transactions and any state other than `Initialized`;
    /// a second `execute` never re-runs commands.
    fn begin(&mut self) -> Result<Vec<Command>> {
        if self.state != TransactionState::Initialized {
            return Err(Error::TransactionAlreadyExecuted {
                transaction_id: self.id,
                state: self.state.to_string(),
            });
        }
        if self.commands.is_empty() {
            return Err(Error::EmptyTransaction {
                transaction_id: self.id,
            });
        }
        self.state = TransactionState::Executing;
        self.started_at = Some(Utc::now());
        Ok(self.commands.clone())
    }

    /// Records the terminal outcome of an execution.
    fn seal(&mut self, results: Vec<CommandResult>, snapshot: Option<StateSnapshot>) {
        self.results = results;
        self.snapshot = snapshot;
        self.state = TransactionState::Executed;
        self.finished_at = Some(Utc::now());
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            command_count: self.commands.len(),
            executed_count: self.results.iter().filter(|r| r.is_success()).count(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            has_snapshot: self.snapshot.is_some(),
        }
    }
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("transaction store lock poisoned")
}

/// Owns every transaction for its full lifetime; callers hold only ids.
pub struct TransactionStore {
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
    executor: Arc<CommandExecutor>,
    gate: Arc<ApplyGate>,
    metrics: EngineMetrics,
}

impl TransactionStore {
    /// Creates a store executing through the given pipeline and gate.
    #[must_use]
    pub fn new(executor: Arc<CommandExecutor>, gate: Arc<ApplyGate>) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            executor,
            gate,
            metrics: EngineMetrics::new(),
        }
    }

    /// Creates a transaction, optionally pre-populated with commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn create(&self, name: Option<String>, commands: Vec<Command>) -> Result<TransactionId> {
        let mut transaction = Transaction::new(name);
        transaction.commands = commands;
        let id = transaction.id();

        let mut transactions = self.transactions.lock().map_err(poison_err)?;
        transactions.insert(id, transaction);
        drop(transactions);

        tracing::debug!(transaction_id = %id, "transaction created");
        Ok(id)
    }

    /// Appends a command to an open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionNotFound`] for unknown ids and
    /// [`Error::TransactionSealed`] once execution has started.
    pub fn add_command(&self, id: TransactionId, command: Command) -> Result<()> {
        let mut transactions = self.transactions.lock().map_err(poison_err)?;
        let transaction = transactions
            .get_mut(&id)
            .ok_or(Error::TransactionNotFound { transaction_id: id })?;
        transaction.add(command)
    }

    /// Executes a transaction's commands in order, atomically with respect
    /// to the apply gate.
    ///
    /// With `create_snapshot`, host state is captured strictly before the
    /// first command; on the first command failure the remaining commands
    /// are skipped and the snapshot is restored. A restore failure is
    /// logged and surfaced as a secondary field — it never replaces the
    /// original failure as the reported cause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransactionNotFound`] for unknown ids,
    /// [`Error::TransactionAlreadyExecuted`] when re-invoked, and
    /// [`Error::EmptyTransaction`] for command-less transactions. Command
    /// failures are not errors; they are reported in the returned
    /// [`TransactionReport`].
    pub fn execute(&self, id: TransactionId, create_snapshot: bool) -> Result<TransactionReport> {
        // Claim under a short lock; handlers must not run while the store
        // is held, or status polling would block for the whole batch.
        let (name, commands) = {
            let mut transactions = self.transactions.lock().map_err(poison_err)?;
            let transaction = transactions
                .get_mut(&id)
                .ok_or(Error::TransactionNotFound { transaction_id: id })?;
            let commands = transaction.begin()?;
            (transaction.name().to_string(), commands)
        };

        let span = transaction_span(&id.to_string(), &name);
        let _span_guard = span.enter();
        let started = Instant::now();
        let total = commands.len();

        let _gate = self.gate.acquire()?;

        // Snapshot strictly before the first command. If capture fails we
        // cannot promise rollback, so nothing runs.
        let provider = Arc::clone(self.executor.state_provider());
        let mut snapshot = None;
        let mut failure: Option<String> = None;
        if create_snapshot {
            match provider.capture(DetailLevel::Full) {
                Ok(captured) => snapshot = Some(captured),
                Err(err) => {
                    tracing::error!(transaction_id = %id, error = %err, "snapshot capture failed; aborting before any command");
                    failure = Some(
                        Error::StateCapture {
                            message: err.to_string(),
                        }
                        .to_string(),
                    );
                }
            }
        }

        let mut results = Vec::with_capacity(total);
        let mut rollback = None;
        if failure.is_none() {
            for (index, command) in commands.iter().enumerate() {
                let result = self.executor.execute(command);
                let error = result.error().map(ToString::to_string);
                let failed = !result.is_success();
                results.push(result.outcome);

                if failed {
                    failure = Some(format!(
                        "command {}/{} '{}' failed: {}",
                        index + 1,
                        total,
                        command.name(),
                        error.unwrap_or_else(|| "no detail".to_string()),
                    ));
                    rollback = snapshot.as_ref().map(|snap| self.restore(id, snap));
                    break;
                }
            }
        }

        let success = failure.is_none();
        let executed = results.iter().filter(|r| r.is_success()).count();
        let execution_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        // Write back under a short lock again.
        {
            let mut transactions = self.transactions.lock().map_err(poison_err)?;
            if let Some(transaction) = transactions.get_mut(&id) {
                transaction.seal(results.clone(), snapshot);
            } else {
                tracing::warn!(transaction_id = %id, "transaction removed while executing");
            }
        }

        let label = match (&failure, &rollback) {
            (None, _) => "committed",
            (Some(_), Some(status)) if status.restored => "rolled_back",
            (Some(_), Some(_)) => "rollback_failed",
            (Some(_), None) => "failed",
        };
        self.metrics.record_transaction(label);
        tracing::info!(
            transaction_id = %id,
            success,
            executed,
            total,
            execution_time_ms,
            "transaction finished"
        );

        Ok(TransactionReport {
            transaction_id: id,
            name,
            success,
            executed,
            total,
            execution_time_ms,
            results,
            failure,
            rollback,
        })
    }

    fn restore(&self, id: TransactionId, snapshot: &StateSnapshot) -> RollbackStatus {
        match self.executor.state_provider().restore(snapshot) {
            Ok(()) => {
                tracing::info!(transaction_id = %id, "rolled back to pre-transaction snapshot");
                RollbackStatus {
                    attempted: true,
                    restored: true,
                    error: None,
                }
            }
            Err(err) => {
                // Logged and surfaced, but the command failure stays the
                // reported cause.
                tracing::error!(transaction_id = %id, error = %err, "snapshot restore failed");
                RollbackStatus {
                    attempted: true,
                    restored: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Returns a point-in-time view of a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn info(&self, id: TransactionId) -> Result<Option<TransactionInfo>> {
        let transactions = self.transactions.lock().map_err(poison_err)?;
        Ok(transactions.get(&id).map(Transaction::info))
    }

    /// Removes a transaction, returning true if it existed.
    ///
    /// Executing transactions are kept; deleting the record out from under
    /// a running batch would lose its results.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn delete(&self, id: TransactionId) -> Result<bool> {
        let mut transactions = self.transactions.lock().map_err(poison_err)?;
        match transactions.get(&id) {
            None => Ok(false),
            Some(transaction) if transaction.state() == TransactionState::Executing => {
                tracing::warn!(transaction_id = %id, "refusing to delete an executing transaction");
                Ok(false)
            }
            Some(_) => {
                transactions.remove(&id);
                Ok(true)
            }
        }
    }

    /// Removes executed transactions that finished more than `max_age` ago.
    ///
    /// Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize> {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;

        let mut transactions = self.transactions.lock().map_err(poison_err)?;
        let before = transactions.len();
        transactions.retain(|_, transaction| {
            transaction.state() != TransactionState::Executed
                || transaction.finished_at.is_none_or(|finished| finished > cutoff)
        });
        let removed = before - transactions.len();
        drop(transactions);

        if removed > 0 {
            tracing::debug!(removed, "cleaned up old transactions");
        }
        Ok(removed)
    }

    /// Returns the number of stored transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let transactions = self.transactions.lock().map_err(poison_err)?;
        Ok(transactions.len())
    }

    /// Returns true if no transactions are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("transactions", &self.len().unwrap_or(0))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::handler::{CommandHandler, HandlerError, Validation};
    use crate::registry::CommandRegistry;
    use crate::state::{MemoryStateProvider, StateProvider};
    use serde_json::{json, Value};

    struct SpawnHandler {
        provider: Arc<MemoryStateProvider>,
    }

    impl CommandHandler for SpawnHandler {
        fn validate(&self, params: &Value) -> Validation {
            if params.get("type").and_then(Value::as_str).is_none() {
                return Validation::reject("missing 'type'");
            }
            Validation::ok()
        }

        fn execute(&self, params: &Value) -> std::result::Result<Value, HandlerError> {
            let kind = params["type"].as_str().unwrap_or_default().to_string();
            let name = format!(
                "{}{}",
                kind[..1].to_ascii_uppercase(),
                &kind[1..]
            );
            self.provider
                .insert(&name, json!({"type": kind}))
                .map_err(|e| HandlerError::host_state(e.to_string()))?;
            Ok(json!({"objectName": name}))
        }
    }

    fn store_fixture() -> (Arc<MemoryStateProvider>, TransactionStore) {
        let provider = Arc::new(MemoryStateProvider::new());
        let registry = Arc::new(CommandRegistry::new());
        registry
            .register(
                "create_object",
                Arc::new(SpawnHandler {
                    provider: Arc::clone(&provider),
                }),
            )
            .unwrap();
        let executor = Arc::new(CommandExecutor::new(
            registry,
            Arc::clone(&provider) as Arc<dyn StateProvider>,
            ExecutorConfig::default(),
        ));
        let store = TransactionStore::new(executor, Arc::new(ApplyGate::new()));
        (provider, store)
    }

    fn create_object(kind: &str) -> Command {
        Command::standard("create_object", json!({"type": kind})).unwrap()
    }

    #[test]
    fn state_machine_is_linear_and_terminal() {
        assert!(TransactionState::Initialized.can_transition_to(TransactionState::Executing));
        assert!(TransactionState::Executing.can_transition_to(TransactionState::Executed));
        assert!(!TransactionState::Executed.can_transition_to(TransactionState::Executing));
        assert!(!TransactionState::Initialized.can_transition_to(TransactionState::Executed));
        assert!(TransactionState::Executed.is_terminal());
    }

    #[test]
    fn successful_batch_commits_all_commands() -> Result<()> {
        let (provider, store) = store_fixture();
        let id = store.create(
            Some("setup-scene".into()),
            vec![create_object("cube"), create_object("sphere")],
        )?;

        let report = store.execute(id, true)?;
        assert!(report.success);
        assert_eq!(report.executed, 2);
        assert_eq!(report.total, 2);
        assert_eq!(report.results.len(), 2);
        assert!(report.rollback.is_none());
        assert!(provider.contains("Cube")?);
        assert!(provider.contains("Sphere")?);

        let info = store.info(id)?.expect("info");
        assert_eq!(info.state, TransactionState::Executed);
        assert_eq!(info.executed_count, 2);
        assert!(info.has_snapshot);
        Ok(())
    }

    #[test]
    fn failure_stops_the_batch_and_rolls_back() -> Result<()> {
        let (provider, store) = store_fixture();
        let id = store.create(
            None,
            vec![
                create_object("cube"),
                Command::standard("nonexistent_command", json!({})).unwrap(),
                create_object("sphere"),
            ],
        )?;

        let report = store.execute(id, true)?;
        assert!(!report.success);
        assert_eq!(report.executed, 1);
        assert_eq!(report.total, 3);
        // The failing command's record is included; the third never ran.
        assert_eq!(report.results.len(), 2);
        assert!(report.failure.as_ref().unwrap().contains("command 2/3"));

        let rollback = report.rollback.expect("rollback");
        assert!(rollback.attempted);
        assert!(rollback.restored);

        // State equals the pre-transaction snapshot, not state-after-cube.
        assert!(!provider.contains("Cube")?);
        assert!(!provider.contains("Sphere")?);
        Ok(())
    }

    #[test]
    fn failure_without_snapshot_keeps_partial_progress() -> Result<()> {
        let (provider, store) = store_fixture();
        let id = store.create(
            None,
            vec![
                create_object("cube"),
                Command::standard("nonexistent_command", json!({})).unwrap(),
            ],
        )?;

        let report = store.execute(id, false)?;
        assert!(!report.success);
        assert!(report.rollback.is_none());
        // No snapshot was requested, so the cube stays.
        assert!(provider.contains("Cube")?);
        Ok(())
    }

    #[test]
    fn execute_is_single_shot() -> Result<()> {
        let (provider, store) = store_fixture();
        let id = store.create(None, vec![create_object("cube")])?;

        let report = store.execute(id, false)?;
        assert!(report.success);
        provider.remove("Cube")?;

        let err = store.execute(id, false).unwrap_err();
        assert!(matches!(err, Error::TransactionAlreadyExecuted { .. }));
        // The rejected re-run executed nothing.
        assert!(!provider.contains("Cube")?);
        Ok(())
    }

    #[test]
    fn add_after_execute_is_rejected() -> Result<()> {
        let (_provider, store) = store_fixture();
        let id = store.create(None, vec![create_object("cube")])?;
        store.execute(id, false)?;

        let err = store.add_command(id, create_object("sphere")).unwrap_err();
        assert!(matches!(err, Error::TransactionSealed { .. }));
        Ok(())
    }

    #[test]
    fn empty_transaction_is_rejected() -> Result<()> {
        let (_provider, store) = store_fixture();
        let id = store.create(None, Vec::new())?;
        let err = store.execute(id, true).unwrap_err();
        assert!(matches!(err, Error::EmptyTransaction { .. }));
        Ok(())
    }

    #[test]
    fn delete_and_cleanup() -> Result<()> {
        let (_provider, store) = store_fixture();
        let open = store.create(None, vec![create_object("cube")])?;
        let done = store.create(None, vec![create_object("sphere")])?;
        store.execute(done, false)?;

        // Only the executed transaction is old enough to collect.
        assert_eq!(store.cleanup_older_than(Duration::ZERO)?, 1);
        assert!(store.info(done)?.is_none());
        assert!(store.info(open)?.is_some());

        assert!(store.delete(open)?);
        assert!(!store.delete(open)?);
        assert!(store.is_empty()?);
        Ok(())
    }

    #[test]
    fn unknown_transaction_errors() {
        let (_provider, store) = store_fixture();
        let missing = TransactionId::generate();
        assert!(matches!(
            store.execute(missing, false),
            Err(Error::TransactionNotFound { .. })
        ));
        assert!(matches!(
            store.add_command(missing, create_object("cube")),
            Err(Error::TransactionNotFound { .. })
        ));
    }
}
