//! Observability metrics for the engine.
//!
//! Metrics are recorded through the `metrics` crate facade; the embedding
//! host decides whether and how to export them. Recording is a no-op until
//! a recorder is installed, so the engine can always call these methods.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tether_tasks_total` | Counter | `from_state`, `to_state` | Task status transitions |
//! | `tether_command_duration_seconds` | Histogram | `command`, `status` | Command dispatch duration |
//! | `tether_scheduler_tick_duration_seconds` | Histogram | - | Tick processing time |
//! | `tether_queue_depth` | Gauge | - | Tasks waiting in the FIFO |
//! | `tether_transactions_total` | Counter | `result` | Transaction outcomes |
//! | `tether_error_patterns_total` | Counter | `kind` | Failure classifications recorded |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Total task status transitions.
    pub const TASKS_TOTAL: &str = "tether_tasks_total";
    /// Histogram: Command dispatch duration in seconds.
    pub const COMMAND_DURATION_SECONDS: &str = "tether_command_duration_seconds";
    /// Histogram: Scheduler tick processing time in seconds.
    pub const SCHEDULER_TICK_DURATION_SECONDS: &str = "tether_scheduler_tick_duration_seconds";
    /// Gauge: Tasks waiting in the FIFO.
    pub const QUEUE_DEPTH: &str = "tether_queue_depth";
    /// Counter: Transaction outcomes.
    pub const TRANSACTIONS_TOTAL: &str = "tether_transactions_total";
    /// Counter: Failure classifications recorded into the pattern table.
    pub const ERROR_PATTERNS_TOTAL: &str = "tether_error_patterns_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Previous task status (for transitions).
    pub const FROM_STATE: &str = "from_state";
    /// Target task status (for transitions).
    pub const TO_STATE: &str = "to_state";
    /// Command name.
    pub const COMMAND: &str = "command";
    /// Final invocation status.
    pub const STATUS: &str = "status";
    /// Transaction outcome (committed, rolled_back, rollback_failed).
    pub const RESULT: &str = "result";
    /// Handler failure category.
    pub const KIND: &str = "kind";
}

/// High-level interface for recording engine metrics.
///
/// Cheap to clone and share across components.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics;

impl EngineMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a task status transition.
    pub fn record_task_transition(&self, from_state: &str, to_state: &str) {
        counter!(
            names::TASKS_TOTAL,
            labels::FROM_STATE => from_state.to_string(),
            labels::TO_STATE => to_state.to_string(),
        )
        .increment(1);
    }

    /// Records one command dispatch duration with its final status.
    pub fn observe_command_duration(&self, command: &str, status: &str, duration: Duration) {
        histogram!(
            names::COMMAND_DURATION_SECONDS,
            labels::COMMAND => command.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records scheduler tick duration.
    pub fn observe_tick_duration(&self, duration: Duration) {
        histogram!(names::SCHEDULER_TICK_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Updates the queue depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are typically small
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::QUEUE_DEPTH).set(depth as f64);
    }

    /// Records a transaction outcome.
    pub fn record_transaction(&self, result: &str) {
        counter!(
            names::TRANSACTIONS_TOTAL,
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records a failure classification.
    pub fn record_error_pattern(&self, kind: &str) {
        counter!(
            names::ERROR_PATTERNS_TOTAL,
            labels::KIND => kind.to_string(),
        )
        .increment(1);
    }
}

/// RAII guard for timing operations.
///
/// Calls the supplied closure with the elapsed duration when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed
    /// duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_does_not_panic() {
        let metrics = EngineMetrics::new();
        metrics.record_task_transition("pending", "processing");
        metrics.observe_command_duration("create_object", "completed", Duration::from_millis(5));
        metrics.observe_tick_duration(Duration::from_millis(1));
        metrics.set_queue_depth(3);
        metrics.record_transaction("committed");
        metrics.record_error_pattern("missing_object");
    }

    #[test]
    fn timing_guard_reports_duration() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| {
                recorded = Some(d);
            });
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }
}
