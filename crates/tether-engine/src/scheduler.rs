//! Cooperative, tick-driven task scheduling.
//!
//! The scheduler never owns a thread. The embedding host calls
//! [`Scheduler::tick`] from its own event loop (a GUI timer, a test
//! harness, a thread with a ticker); each tick claims at most one task and
//! executes it synchronously on the calling thread — the apply thread. The
//! return value tells the host whether to reschedule and how soon.
//!
//! ## Failure containment
//!
//! Everything a task can do wrong is converted into a Failed status at the
//! tick boundary: payload parse errors, unknown commands, handler failures,
//! even handler panics (contained inside the executor). A bad task never
//! terminates the loop and never leaves the processing flag stuck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};

use tether_core::observability::scheduler_span;
use tether_core::TaskId;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::executor::CommandExecutor;
use crate::metrics::{EngineMetrics, TimingGuard};
use crate::queue::{ClaimedTask, TaskQueue};
use crate::state::DetailLevel;
use crate::task::TaskKind;

/// Default interval suggested to hosts between ticks while work remains.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serializes the paths that mutate host state.
///
/// Both the scheduler tick and direct transaction execution acquire this
/// gate before touching the host, so the two mutation paths are mutually
/// exclusive by construction instead of by convention.
#[derive(Debug, Default)]
pub struct ApplyGate {
    lock: Mutex<()>,
}

impl ApplyGate {
    /// Creates a new gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the gate, blocking until the other mutation path finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate lock is poisoned.
    pub fn acquire(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_: PoisonError<_>| Error::internal("apply gate poisoned"))
    }
}

/// Hook invoked when a submission arrives while the scheduler is idle.
///
/// Hosts use this to re-arm their timer so the queue drains without a
/// standing poll.
pub type WakeHook = Box<dyn Fn() + Send + Sync>;

/// Cooperative single-concurrency scheduler over a [`TaskQueue`].
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    executor: Arc<CommandExecutor>,
    gate: Arc<ApplyGate>,
    poll_interval: Duration,
    processing: AtomicBool,
    active: AtomicBool,
    wake_hook: Mutex<Option<WakeHook>>,
    metrics: EngineMetrics,
}

impl Scheduler {
    /// Creates a scheduler over the given queue and executor.
    #[must_use]
    pub fn new(
        queue: Arc<TaskQueue>,
        executor: Arc<CommandExecutor>,
        gate: Arc<ApplyGate>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            executor,
            gate,
            poll_interval,
            processing: AtomicBool::new(false),
            active: AtomicBool::new(false),
            wake_hook: Mutex::new(None),
            metrics: EngineMetrics::new(),
        }
    }

    /// Installs the idle-wake hook.
    ///
    /// # Errors
    ///
    /// Returns an error if the hook lock is poisoned.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) -> Result<()> {
        let mut slot = self
            .wake_hook
            .lock()
            .map_err(|_| Error::internal("wake hook lock poisoned"))?;
        *slot = Some(Box::new(hook));
        Ok(())
    }

    /// Returns true if a tick is currently executing a task.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Returns true if the scheduler considers itself active (work pending
    /// or recently triggered).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Notes a new submission, waking an idle scheduler exactly once.
    ///
    /// Idempotent: re-triggering an active scheduler is a no-op.
    pub fn notify_submitted(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            if let Ok(slot) = self.wake_hook.lock() {
                if let Some(hook) = slot.as_ref() {
                    hook();
                }
            }
        }
    }

    /// Runs one tick: claim at most one task, execute it, record the
    /// outcome.
    ///
    /// Returns `Some(interval)` when the host should tick again after
    /// `interval` (work remains), `None` when the queue is idle and the
    /// timer can stop. A reentrant tick while a task is executing just asks
    /// to be rescheduled.
    pub fn tick(&self) -> Option<Duration> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Some(self.poll_interval);
        }
        let _processing = ReleaseOnDrop(&self.processing);
        let metrics = self.metrics.clone();
        let _timing = TimingGuard::new(move |elapsed| metrics.observe_tick_duration(elapsed));

        let claimed = match self.queue.claim_next() {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                self.active.store(false, Ordering::SeqCst);
                self.metrics.set_queue_depth(0);
                return None;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to claim next task");
                return Some(self.poll_interval);
            }
        };
        self.metrics
            .record_task_transition("pending", "processing");

        let outcome = {
            let gate = self.gate.acquire();
            let span = scheduler_span(&claimed.id.to_string());
            let _span_guard = span.enter();
            match gate {
                Ok(_gate) => self.run_task(&claimed),
                Err(err) => Err(err.to_string()),
            }
        };

        self.settle(claimed.id, outcome);

        match self.queue.len() {
            Ok(0) => {
                self.active.store(false, Ordering::SeqCst);
                self.metrics.set_queue_depth(0);
                None
            }
            Ok(depth) => {
                self.metrics.set_queue_depth(depth);
                Some(self.poll_interval)
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to read queue depth");
                Some(self.poll_interval)
            }
        }
    }

    /// Records a task outcome, logging rather than propagating store
    /// failures so the loop survives.
    fn settle(&self, id: TaskId, outcome: std::result::Result<Value, String>) {
        let stored = match outcome {
            Ok(value) => {
                self.metrics
                    .record_task_transition("processing", "completed");
                self.queue.complete(id, value)
            }
            Err(message) => {
                tracing::debug!(task_id = %id, error = %message, "task failed");
                self.metrics.record_task_transition("processing", "failed");
                self.queue.fail(id, message)
            }
        };
        if let Err(err) = stored {
            tracing::error!(task_id = %id, error = %err, "failed to record task outcome");
        }
    }

    /// Interprets one claimed task by kind.
    fn run_task(&self, claimed: &ClaimedTask) -> std::result::Result<Value, String> {
        match claimed.kind {
            TaskKind::Execute => {
                let command = parse_command(&claimed.payload).map_err(|e| e.to_string())?;
                let result = self.executor.execute(&command);
                if result.is_success() {
                    serde_json::to_value(&result).map_err(|e| e.to_string())
                } else {
                    Err(result
                        .error()
                        .unwrap_or("command failed without detail")
                        .to_string())
                }
            }
            TaskKind::GetState => {
                let detail = parse_detail(&claimed.payload).map_err(|e| e.to_string())?;
                let snapshot = self.executor.capture(detail).map_err(|e| e.to_string())?;
                serde_json::to_value(&snapshot).map_err(|e| e.to_string())
            }
            TaskKind::Batch => {
                let commands = parse_batch(&claimed.payload).map_err(|e| e.to_string())?;
                let total = commands.len();
                let mut results = Vec::with_capacity(total);
                for (index, command) in commands.iter().enumerate() {
                    let result = self.executor.execute(command);
                    let failed = !result.is_success();
                    let error = result.error().map(ToString::to_string);
                    results.push(result);
                    if failed {
                        // Stop at the first failure; remaining commands
                        // never run. Partial results are reported in the
                        // failure description.
                        return Err(format!(
                            "batch command {}/{} '{}' failed: {} ({} completed before it)",
                            index + 1,
                            total,
                            command.name(),
                            error.unwrap_or_else(|| "no detail".to_string()),
                            index
                        ));
                    }
                }
                Ok(json!({
                    "count": total,
                    "results": results,
                }))
            }
        }
    }
}

struct ReleaseOnDrop<'a>(&'a AtomicBool);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("poll_interval", &self.poll_interval)
            .field("processing", &self.is_processing())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Parses an `Execute` payload into a validated command.
fn parse_command(payload: &Value) -> Result<Command> {
    let command: Command = serde_json::from_value(payload.clone())
        .map_err(|e| Error::invalid_payload(format!("expected a command object: {e}")))?;
    command.ensure_valid()?;
    Ok(command)
}

/// Parses a `GetState` payload (`{"detail": "summary" | "standard" | "full"}`).
fn parse_detail(payload: &Value) -> Result<DetailLevel> {
    match payload.get("detail") {
        None => Ok(DetailLevel::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_payload(format!("unknown detail level: {e}"))),
    }
}

/// Parses a `Batch` payload into a validated command list.
fn parse_batch(payload: &Value) -> Result<Vec<Command>> {
    let commands: Vec<Command> = serde_json::from_value(payload.clone())
        .map_err(|e| Error::invalid_payload(format!("expected a command array: {e}")))?;
    if commands.is_empty() {
        return Err(Error::invalid_payload("batch contains no commands"));
    }
    for command in &commands {
        command.ensure_valid()?;
    }
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::handler::{FailingHandler, HandlerError, NoOpHandler};
    use crate::registry::CommandRegistry;
    use crate::state::MemoryStateProvider;
    use crate::task::{Task, TaskStatus};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn scheduler_fixture() -> (Arc<TaskQueue>, Scheduler) {
        let registry = Arc::new(CommandRegistry::new());
        registry.register("noop", Arc::new(NoOpHandler)).unwrap();
        registry
            .register(
                "broken",
                Arc::new(FailingHandler::new(HandlerError::host_state(
                    "scene is locked",
                ))),
            )
            .unwrap();
        let executor = Arc::new(CommandExecutor::new(
            registry,
            Arc::new(MemoryStateProvider::new()),
            ExecutorConfig::default(),
        ));
        let queue = Arc::new(TaskQueue::new(16));
        let scheduler = Scheduler::new(
            Arc::clone(&queue),
            executor,
            Arc::new(ApplyGate::new()),
            DEFAULT_POLL_INTERVAL,
        );
        (queue, scheduler)
    }

    fn execute_payload(name: &str) -> Value {
        json!({"kind": "standard", "name": name, "params": {}})
    }

    #[test]
    fn idle_tick_returns_none() {
        let (_queue, scheduler) = scheduler_fixture();
        assert!(scheduler.tick().is_none());
        assert!(!scheduler.is_processing());
    }

    #[test]
    fn tick_executes_one_task_and_hints_reschedule() {
        let (queue, scheduler) = scheduler_fixture();
        let first = queue
            .submit(Task::new(TaskKind::Execute, execute_payload("noop")))
            .unwrap();
        let second = queue
            .submit(Task::new(TaskKind::Execute, execute_payload("noop")))
            .unwrap();

        // One task per tick; work remains, so a reschedule hint comes back.
        assert_eq!(scheduler.tick(), Some(DEFAULT_POLL_INTERVAL));
        let first_task = queue.status_of(first).unwrap().unwrap();
        assert_eq!(first_task.status, TaskStatus::Completed);
        let second_task = queue.status_of(second).unwrap().unwrap();
        assert_eq!(second_task.status, TaskStatus::Pending);

        // Queue drains; the scheduler goes idle.
        assert!(scheduler.tick().is_none());
        assert_eq!(
            queue.status_of(second).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn failing_task_never_kills_the_loop() {
        let (queue, scheduler) = scheduler_fixture();
        let bad = queue
            .submit(Task::new(TaskKind::Execute, execute_payload("broken")))
            .unwrap();
        let good = queue
            .submit(Task::new(TaskKind::Execute, execute_payload("noop")))
            .unwrap();

        scheduler.tick();
        let bad_task = queue.status_of(bad).unwrap().unwrap();
        assert_eq!(bad_task.status, TaskStatus::Failed);
        assert!(bad_task.error.unwrap().contains("scene is locked"));
        assert!(!scheduler.is_processing());

        scheduler.tick();
        assert_eq!(
            queue.status_of(good).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn malformed_payload_fails_the_task() {
        let (queue, scheduler) = scheduler_fixture();
        let id = queue
            .submit(Task::new(TaskKind::Execute, json!({"not": "a command"})))
            .unwrap();

        scheduler.tick();
        let task = queue.status_of(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("expected a command object"));
    }

    #[test]
    fn get_state_task_returns_snapshot() {
        let (queue, scheduler) = scheduler_fixture();
        let id = queue
            .submit(Task::new(TaskKind::GetState, json!({"detail": "full"})))
            .unwrap();

        scheduler.tick();
        let task = queue.status_of(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let result = task.result.unwrap();
        assert_eq!(result["detail"], "full");
        assert!(result["entities"].is_object());
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let (queue, scheduler) = scheduler_fixture();
        let id = queue
            .submit(Task::new(
                TaskKind::Batch,
                json!([
                    {"kind": "standard", "name": "noop", "params": {}},
                    {"kind": "standard", "name": "broken", "params": {}},
                    {"kind": "standard", "name": "noop", "params": {}},
                ]),
            ))
            .unwrap();

        scheduler.tick();
        let task = queue.status_of(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert!(error.contains("batch command 2/3"));
        assert!(error.contains("1 completed before it"));
    }

    #[test]
    fn wake_hook_fires_once_until_idle_again() {
        let (queue, scheduler) = scheduler_fixture();
        let wakes = Arc::new(AtomicUsize::new(0));
        {
            let wakes = Arc::clone(&wakes);
            scheduler
                .set_wake_hook(move || {
                    wakes.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        queue
            .submit(Task::new(TaskKind::Execute, execute_payload("noop")))
            .unwrap();
        scheduler.notify_submitted();
        scheduler.notify_submitted(); // idempotent while active
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // Draining the queue flips the scheduler idle; the next submission
        // wakes again.
        while scheduler.tick().is_some() {}
        queue
            .submit(Task::new(TaskKind::Execute, execute_payload("noop")))
            .unwrap();
        scheduler.notify_submitted();
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }
}
