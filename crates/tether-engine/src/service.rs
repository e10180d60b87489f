//! Engine assembly and the facade exposed to protocol adapters.
//!
//! [`EngineService`] wires the registry, executor, queue, scheduler, and
//! transaction store into one owned unit. There are no module-level
//! singletons: every service is a fresh set of instances, so tests and
//! multi-host embeddings get isolated engines.
//!
//! The thin wire layers (HTTP/RPC/query endpoints) translate their requests
//! into these methods and nothing else.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use tether_core::{TaskId, TransactionId};

use crate::command::Command;
use crate::diagnostics::{ErrorPattern, ExecutionRecord, ExecutionStats};
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, ExecutorConfig};
use crate::handler::CommandHandler;
use crate::metrics::EngineMetrics;
use crate::queue::{QueueStatus, TaskOutcome, TaskQueue};
use crate::registry::{CommandMetadata, CommandRegistry};
use crate::scheduler::{ApplyGate, Scheduler, DEFAULT_POLL_INTERVAL};
use crate::state::{DetailLevel, StateProvider};
use crate::task::{Task, TaskKind};
use crate::transaction::{TransactionInfo, TransactionReport, TransactionStore};

const ENV_QUEUE_CAPACITY: &str = "TETHER_QUEUE_CAPACITY";
const ENV_POLL_INTERVAL_MS: &str = "TETHER_POLL_INTERVAL_MS";
const ENV_HISTORY_LIMIT: &str = "TETHER_HISTORY_LIMIT";
const ENV_PATTERN_LIMIT: &str = "TETHER_ERROR_PATTERN_LIMIT";
const ENV_PATTERN_LOG_EVERY: &str = "TETHER_ERROR_PATTERN_LOG_EVERY";

/// Engine-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Task queue capacity bound.
    pub queue_capacity: usize,
    /// Interval suggested to hosts between ticks while work remains.
    pub poll_interval: Duration,
    /// Entries retained in the execution-history ring.
    pub history_limit: usize,
    /// Distinct signatures retained in the error-pattern table.
    pub pattern_limit: usize,
    /// Emit a diagnostic warning every Nth occurrence of a pattern.
    pub pattern_log_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::queue::DEFAULT_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            history_limit: 1000,
            pattern_limit: 256,
            pattern_log_every: 5,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from process environment with strict validation.
    ///
    /// Unset keys keep their defaults. Values must be positive integers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let queue_capacity =
            parse_positive_env(&get_env, ENV_QUEUE_CAPACITY, defaults.queue_capacity as u64)?;
        let poll_interval_ms = parse_positive_env(
            &get_env,
            ENV_POLL_INTERVAL_MS,
            u64::try_from(defaults.poll_interval.as_millis()).unwrap_or(100),
        )?;
        let history_limit =
            parse_positive_env(&get_env, ENV_HISTORY_LIMIT, defaults.history_limit as u64)?;
        let pattern_limit =
            parse_positive_env(&get_env, ENV_PATTERN_LIMIT, defaults.pattern_limit as u64)?;
        let pattern_log_every =
            parse_positive_env(&get_env, ENV_PATTERN_LOG_EVERY, defaults.pattern_log_every)?;

        Ok(Self {
            queue_capacity: usize::try_from(queue_capacity).map_err(|_| {
                Error::configuration(format!("{ENV_QUEUE_CAPACITY} exceeds supported range"))
            })?,
            poll_interval: Duration::from_millis(poll_interval_ms),
            history_limit: usize::try_from(history_limit).map_err(|_| {
                Error::configuration(format!("{ENV_HISTORY_LIMIT} exceeds supported range"))
            })?,
            pattern_limit: usize::try_from(pattern_limit).map_err(|_| {
                Error::configuration(format!("{ENV_PATTERN_LIMIT} exceeds supported range"))
            })?,
            pattern_log_every,
        })
    }
}

fn parse_positive_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

/// Receipt for a submitted task.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// The id callers poll or wait on.
    pub task_id: TaskId,
    /// The blocking-wait result, present for synchronous submissions that
    /// finished before their timeout.
    pub outcome: Option<TaskOutcome>,
}

/// The command execution and transaction subsystem, fully assembled.
pub struct EngineService {
    registry: Arc<CommandRegistry>,
    executor: Arc<CommandExecutor>,
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    transactions: TransactionStore,
    metrics: EngineMetrics,
}

impl EngineService {
    /// Builds an engine over the host's state provider.
    #[must_use]
    pub fn new(provider: Arc<dyn StateProvider>, config: &EngineConfig) -> Self {
        let registry = Arc::new(CommandRegistry::new());
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&registry),
            provider,
            ExecutorConfig {
                history_limit: config.history_limit,
                pattern_limit: config.pattern_limit,
                pattern_log_every: config.pattern_log_every,
                ..ExecutorConfig::default()
            },
        ));
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let gate = Arc::new(ApplyGate::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&executor),
            Arc::clone(&gate),
            config.poll_interval,
        ));
        let transactions = TransactionStore::new(Arc::clone(&executor), gate);

        Self {
            registry,
            executor,
            queue,
            scheduler,
            transactions,
            metrics: EngineMetrics::new(),
        }
    }

    /// Builds an engine with default configuration.
    #[must_use]
    pub fn with_defaults(provider: Arc<dyn StateProvider>) -> Self {
        Self::new(provider, &EngineConfig::default())
    }

    /// Returns the command registry for handler registration.
    #[must_use]
    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Registers a handler; see [`CommandRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn register_command(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<bool> {
        self.registry.register(name, handler)
    }

    /// Submits a fire-and-forget task.
    ///
    /// Wakes an idle scheduler; re-triggering an active one is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when the queue is at capacity.
    pub fn submit_task(
        &self,
        kind: TaskKind,
        payload: Value,
        name: Option<String>,
    ) -> Result<TaskId> {
        let mut task = Task::new(kind, payload);
        if let Some(name) = name {
            task = task.with_name(name);
        }
        let id = self.queue.submit(task)?;
        if let Ok(depth) = self.queue.len() {
            self.metrics.set_queue_depth(depth);
        }
        self.scheduler.notify_submitted();
        Ok(id)
    }

    /// Submits a task and blocks until it finishes or the timeout elapses.
    ///
    /// The receipt's `outcome` is `None` purely on timeout; the task keeps
    /// executing and remains queryable by its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when the queue is at capacity.
    pub fn submit_and_wait(
        &self,
        kind: TaskKind,
        payload: Value,
        name: Option<String>,
        timeout: Duration,
    ) -> Result<SubmitReceipt> {
        let task_id = self.submit_task(kind, payload, name)?;
        let outcome = self.queue.wait(task_id, timeout)?;
        Ok(SubmitReceipt { task_id, outcome })
    }

    /// Blocks until a task finishes or the timeout elapses.
    ///
    /// Returns `None` purely on timeout — the task is not cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] for unknown ids.
    pub fn wait(&self, id: TaskId, timeout: Duration) -> Result<Option<TaskOutcome>> {
        self.queue.wait(id, timeout)
    }

    /// Returns a point-in-time snapshot of a task record.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn task_status(&self, id: TaskId) -> Result<Option<Task>> {
        self.queue.status_of(id)
    }

    /// Returns aggregate queue counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn queue_status(&self) -> Result<QueueStatus> {
        self.queue.status()
    }

    /// Runs one scheduler tick on the calling thread.
    ///
    /// The caller must be the host's apply thread. Returns the reschedule
    /// hint; see [`Scheduler::tick`].
    pub fn tick(&self) -> Option<Duration> {
        self.scheduler.tick()
    }

    /// Installs the scheduler's idle-wake hook.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook lock is poisoned.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.scheduler.set_wake_hook(hook)
    }

    /// Removes finished task records older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn clear_finished_tasks(&self, max_age: Duration) -> Result<usize> {
        self.queue.clear_finished(max_age)
    }

    /// Creates a transaction, optionally pre-populated with commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn create_transaction(
        &self,
        name: Option<String>,
        commands: Vec<Command>,
    ) -> Result<TransactionId> {
        self.transactions.create(name, commands)
    }

    /// Appends a command to an open transaction.
    ///
    /// # Errors
    ///
    /// See [`TransactionStore::add_command`].
    pub fn add_transaction_command(&self, id: TransactionId, command: Command) -> Result<()> {
        self.transactions.add_command(id, command)
    }

    /// Executes a transaction; see [`TransactionStore::execute`].
    ///
    /// The embedding host must call this from the apply thread; the apply
    /// gate makes it mutually exclusive with scheduler ticks.
    ///
    /// # Errors
    ///
    /// See [`TransactionStore::execute`].
    pub fn execute_transaction(
        &self,
        id: TransactionId,
        create_snapshot: bool,
    ) -> Result<TransactionReport> {
        self.transactions.execute(id, create_snapshot)
    }

    /// Returns a point-in-time view of a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn transaction_info(&self, id: TransactionId) -> Result<Option<TransactionInfo>> {
        self.transactions.info(id)
    }

    /// Removes a transaction, returning true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn delete_transaction(&self, id: TransactionId) -> Result<bool> {
        self.transactions.delete(id)
    }

    /// Removes executed transactions older than `max_age`, returning the
    /// number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn cleanup_transactions(&self, max_age: Duration) -> Result<usize> {
        self.transactions.cleanup_older_than(max_age)
    }

    /// Captures host state at the given detail level.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot read host state.
    pub fn capture_state(&self, detail: DetailLevel) -> Result<crate::state::StateSnapshot> {
        self.executor.capture(detail)
    }

    /// Returns aggregate execution statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn execution_stats(&self) -> Result<ExecutionStats> {
        self.executor.stats()
    }

    /// Returns up to `limit` most recent execution records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn execution_history(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.executor.history(limit)
    }

    /// Returns every tracked error pattern, most frequent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the diagnostics lock is poisoned.
    pub fn error_patterns(&self) -> Result<Vec<ErrorPattern>> {
        self.executor.error_patterns()
    }

    /// Lists metadata for every registered command, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn commands(&self) -> Result<Vec<CommandMetadata>> {
        self.registry.list()
    }
}

impl std::fmt::Debug for EngineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineService")
            .field("queue", &self.queue)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NullStateProvider;

    #[test]
    fn config_defaults_from_empty_env() {
        let config = EngineConfig::from_env_with(|_| None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn config_reads_overrides() {
        let config = EngineConfig::from_env_with(|key| match key {
            ENV_QUEUE_CAPACITY => Some("32".to_string()),
            ENV_POLL_INTERVAL_MS => Some("250".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.queue_capacity, 32);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.history_limit, EngineConfig::default().history_limit);
    }

    #[test]
    fn config_rejects_zero_and_garbage() {
        let zero = EngineConfig::from_env_with(|key| {
            (key == ENV_QUEUE_CAPACITY).then(|| "0".to_string())
        });
        assert!(matches!(zero, Err(Error::Configuration { .. })));

        let garbage = EngineConfig::from_env_with(|key| {
            (key == ENV_HISTORY_LIMIT).then(|| "lots".to_string())
        });
        assert!(matches!(garbage, Err(Error::Configuration { .. })));
    }

    #[test]
    fn fresh_services_are_isolated() {
        let first = EngineService::with_defaults(Arc::new(NullStateProvider));
        let second = EngineService::with_defaults(Arc::new(NullStateProvider));

        first
            .register_command("only_here", Arc::new(crate::handler::NoOpHandler))
            .unwrap();
        assert_eq!(first.commands().unwrap().len(), 1);
        assert!(second.commands().unwrap().is_empty());
    }
}
