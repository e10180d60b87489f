//! Bounded, thread-safe FIFO of pending tasks.
//!
//! Any number of threads may submit; the scheduler claims one task per tick
//! on the apply thread. The queue owns every task record for its full
//! lifetime — callers hold only ids and read snapshots.
//!
//! ## Lock discipline
//!
//! A single mutex guards the FIFO and the id→task table. It is held only
//! for map mutations and snapshot reads, never while a handler runs: the
//! scheduler claims an owned work order, executes outside the lock, then
//! reacquires briefly to record the outcome. Completion wakes waiters
//! through a condvar, so a `wait` caller never polls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::TaskId;

use crate::error::{Error, Result};
use crate::task::{Task, TaskKind, TaskStatus};

/// Default queue capacity when none is configured.
pub const DEFAULT_CAPACITY: usize = 256;

/// Aggregate queue counters for status polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Tasks currently waiting in the FIFO.
    pub queue_size: usize,
    /// Configured capacity bound.
    pub capacity: usize,
    /// Tasks with status `Pending`.
    pub pending: usize,
    /// Tasks with status `Processing` (0 or 1).
    pub processing: usize,
    /// Tasks with status `Completed`.
    pub completed: usize,
    /// Tasks with status `Failed`.
    pub failed: usize,
    /// The task currently executing, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
}

/// Terminal outcome of a task, returned to `wait` callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    /// The task this outcome belongs to.
    pub task_id: TaskId,
    /// Terminal status (`Completed` or `Failed`).
    pub status: TaskStatus,
    /// Execution result. Set iff status is `Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description. Set iff status is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl TaskOutcome {
    /// Returns true if the task completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            execution_time_ms: task.execution_time_ms(),
        }
    }
}

/// Owned work order handed to the scheduler.
///
/// Carries everything execution needs so the queue lock is released before
/// the handler runs.
#[derive(Debug)]
pub struct ClaimedTask {
    /// The claimed task's id.
    pub id: TaskId,
    /// The claimed task's kind.
    pub kind: TaskKind,
    /// The claimed task's display name.
    pub name: String,
    /// The claimed task's payload.
    pub payload: Value,
}

#[derive(Default)]
struct QueueInner {
    fifo: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Task>,
    current: Option<TaskId>,
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("task queue lock poisoned")
}

/// Bounded FIFO holding pending tasks plus the records of finished ones.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    finished: Condvar,
    capacity: usize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TaskQueue {
    /// Creates a queue with the given capacity bound.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            finished: Condvar::new(),
            capacity,
        }
    }

    /// Returns the configured capacity bound.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>> {
        self.inner.lock().map_err(poison_err)
    }

    /// Inserts a pending task at the back of the FIFO.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when the FIFO is at capacity; the
    /// caller may retry or drop. The occupied count never exceeds the
    /// capacity bound.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        let mut inner = self.lock()?;
        if inner.fifo.len() >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }

        let id = task.id;
        inner.fifo.push_back(id);
        inner.tasks.insert(id, task);
        let depth = inner.fifo.len();
        drop(inner);

        tracing::debug!(task_id = %id, depth, "task submitted");
        Ok(id)
    }

    /// Claims the next pending task, marking it `Processing`.
    ///
    /// Returns an owned work order; the handler must run outside the queue
    /// lock. At most one task is processing at any instant because only the
    /// apply thread claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned or a claimed record
    /// violated the status machine.
    pub fn claim_next(&self) -> Result<Option<ClaimedTask>> {
        let mut inner = self.lock()?;
        let Some(id) = inner.fifo.pop_front() else {
            return Ok(None);
        };

        let Some(task) = inner.tasks.get_mut(&id) else {
            // Cleanup raced a pending task away; surface rather than skip.
            return Err(Error::TaskNotFound { task_id: id });
        };
        task.start()?;
        let claimed = ClaimedTask {
            id,
            kind: task.kind,
            name: task.name.clone(),
            payload: task.payload.clone(),
        };
        inner.current = Some(id);
        drop(inner);

        Ok(Some(claimed))
    }

    /// Records successful execution and wakes waiters exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or not processing.
    pub fn complete(&self, id: TaskId, result: Value) -> Result<()> {
        self.finish(id, |task| task.complete(result))
    }

    /// Records failed execution and wakes waiters exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the task is unknown or not processing.
    pub fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.finish(id, move |task| task.fail(error))
    }

    fn finish(&self, id: TaskId, apply: impl FnOnce(&mut Task) -> Result<()>) -> Result<()> {
        let mut inner = self.lock()?;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(Error::TaskNotFound { task_id: id })?;
        apply(task)?;
        if inner.current == Some(id) {
            inner.current = None;
        }
        drop(inner);

        self.finished.notify_all();
        Ok(())
    }

    /// Blocks the calling thread until the task reaches a terminal status
    /// or the timeout elapses.
    ///
    /// Returns `None` purely on timeout — distinct from a failed outcome.
    /// Timing out never cancels the task: it continues toward completion
    /// and stays queryable by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNotFound`] if no task exists under the id
    /// (never submitted, or already cleaned up).
    pub fn wait(&self, id: TaskId, timeout: Duration) -> Result<Option<TaskOutcome>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock()?;
        loop {
            match inner.tasks.get(&id) {
                None => return Err(Error::TaskNotFound { task_id: id }),
                Some(task) if task.is_terminal() => {
                    return Ok(Some(TaskOutcome::from_task(task)));
                }
                Some(_) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _timeout_result) = self
                .finished
                .wait_timeout(inner, deadline - now)
                .map_err(poison_err)?;
            inner = guard;
        }
    }

    /// Returns a point-in-time snapshot of a task record.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn status_of(&self, id: TaskId) -> Result<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner.tasks.get(&id).cloned())
    }

    /// Returns aggregate queue counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn status(&self) -> Result<QueueStatus> {
        let inner = self.lock()?;
        let mut status = QueueStatus {
            queue_size: inner.fifo.len(),
            capacity: self.capacity,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            current_task: inner.current,
        };
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => status.pending += 1,
                TaskStatus::Processing => status.processing += 1,
                TaskStatus::Completed => status.completed += 1,
                TaskStatus::Failed => status.failed += 1,
            }
        }
        drop(inner);
        Ok(status)
    }

    /// Returns the number of tasks waiting in the FIFO.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let inner = self.lock()?;
        Ok(inner.fifo.len())
    }

    /// Returns true if no tasks are waiting in the FIFO.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes terminal task records older than `max_age`.
    ///
    /// Pending and processing tasks are never touched. Returns the number
    /// of records removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn clear_finished(&self, max_age: Duration) -> Result<usize> {
        // Out-of-range ages degrade to "keep everything" rather than panic.
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - max_age;
        let mut inner = self.lock()?;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, task| {
            if !task.is_terminal() {
                return true;
            }
            let finished_at = task.completed_at.unwrap_or(task.created_at);
            finished_at > cutoff
        });
        let removed = before - inner.tasks.len();
        drop(inner);

        if removed > 0 {
            tracing::debug!(removed, "cleared finished tasks");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("depth", &self.len().unwrap_or(0))
            .finish()
    }
}
