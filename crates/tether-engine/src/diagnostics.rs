//! Execution history and error-frequency diagnostics.
//!
//! Every pass through the dispatch pipeline leaves one entry in a bounded
//! history ring. Failures are additionally aggregated into
//! [`ErrorPattern`]s keyed by `(kind, message prefix)`, so a recurring
//! failure shows up as one counted pattern instead of a wall of identical
//! log lines. Both structures live in process memory only and reset on
//! restart.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::CommandId;

use crate::state::ChangeSet;

/// How many characters of the failure message participate in the pattern
/// key.
pub const MESSAGE_PREFIX_LEN: usize = 50;

/// How many sample command names a pattern retains.
const SAMPLE_LIMIT: usize = 8;

/// Classification key for recurring failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSignature {
    /// Failure category label.
    pub kind: String,
    /// Normalized message prefix (at most [`MESSAGE_PREFIX_LEN`] chars).
    pub message_prefix: String,
}

impl ErrorSignature {
    /// Builds a signature from a category label and a failure message.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: &str) -> Self {
        Self {
            kind: kind.into(),
            message_prefix: message.chars().take(MESSAGE_PREFIX_LEN).collect(),
        }
    }
}

impl std::fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.message_prefix)
    }
}

/// Aggregated record of one recurring failure signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    /// The signature this pattern counts.
    pub signature: ErrorSignature,
    /// Occurrences since the pattern was created.
    pub count: u64,
    /// When the signature first occurred.
    pub first_seen: DateTime<Utc>,
    /// When the signature last occurred.
    pub last_seen: DateTime<Utc>,
    /// Names of commands that produced the failure (bounded).
    pub sample_commands: Vec<String>,
}

/// Bounded table of error patterns.
///
/// When full, recording a new signature evicts the pattern that was seen
/// least recently — recurring failures survive, one-off noise ages out.
#[derive(Debug)]
pub struct ErrorPatternTable {
    patterns: HashMap<ErrorSignature, ErrorPattern>,
    limit: usize,
}

impl ErrorPatternTable {
    /// Creates a table bounded to `limit` distinct signatures.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            patterns: HashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Counts one occurrence of a signature, creating the pattern on first
    /// sight. Returns the pattern's updated count.
    pub fn record(&mut self, signature: ErrorSignature, command_name: &str) -> u64 {
        let now = Utc::now();
        if !self.patterns.contains_key(&signature) && self.patterns.len() >= self.limit {
            self.evict_least_recent();
        }

        let pattern = self
            .patterns
            .entry(signature.clone())
            .or_insert_with(|| ErrorPattern {
                signature,
                count: 0,
                first_seen: now,
                last_seen: now,
                sample_commands: Vec::new(),
            });
        pattern.count += 1;
        pattern.last_seen = now;
        if pattern.sample_commands.len() < SAMPLE_LIMIT
            && !pattern.sample_commands.iter().any(|c| c == command_name)
        {
            pattern.sample_commands.push(command_name.to_string());
        }
        pattern.count
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .patterns
            .values()
            .min_by_key(|pattern| pattern.last_seen)
            .map(|pattern| pattern.signature.clone());
        if let Some(signature) = oldest {
            self.patterns.remove(&signature);
        }
    }

    /// Returns the number of distinct patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if no patterns were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns every pattern, most frequent first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ErrorPattern> {
        let mut patterns: Vec<_> = self.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns
    }
}

/// One entry in the execution-history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// The invocation this entry records.
    pub command_id: CommandId,
    /// The command's registered name.
    pub command_name: String,
    /// Whether the invocation completed successfully.
    pub success: bool,
    /// Failure description, when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock handler duration.
    pub execution_time_ms: u64,
    /// When the invocation finished.
    pub executed_at: DateTime<Utc>,
    /// Entities the invocation touched, when state capture was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<ChangeSet>,
}

/// Bounded ring of execution records, newest last.
#[derive(Debug)]
pub struct ExecutionHistory {
    entries: VecDeque<ExecutionRecord>,
    limit: usize,
}

impl ExecutionHistory {
    /// Creates a history ring bounded to `limit` entries.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    /// Appends a record, dropping the oldest entry when full.
    pub fn push(&mut self, record: ExecutionRecord) {
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    /// Returns up to `limit` most recent records, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    /// Returns the number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over retained records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.entries.iter()
    }
}

/// Aggregate execution statistics over the retained history window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    /// Invocations in the window.
    pub total: usize,
    /// Successful invocations.
    pub succeeded: usize,
    /// Failed invocations.
    pub failed: usize,
    /// Fraction of successful invocations (0 when the window is empty).
    pub success_rate: f64,
    /// Mean handler duration across the window.
    pub avg_execution_time_ms: f64,
    /// Distinct error patterns currently tracked.
    pub pattern_count: usize,
    /// The most frequent error signatures, at most five.
    pub frequent_errors: Vec<FrequentError>,
}

/// One entry of the frequent-error leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequentError {
    /// Rendered signature (`kind:prefix`).
    pub signature: String,
    /// Occurrences since the pattern was created.
    pub count: u64,
}

impl ExecutionStats {
    /// Computes statistics from a history window and a pattern table.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(history: &ExecutionHistory, patterns: &ErrorPatternTable) -> Self {
        let total = history.len();
        if total == 0 {
            return Self {
                pattern_count: patterns.len(),
                ..Self::default()
            };
        }

        let succeeded = history.iter().filter(|record| record.success).count();
        let total_ms: u64 = history.iter().map(|record| record.execution_time_ms).sum();
        let frequent_errors = patterns
            .snapshot()
            .into_iter()
            .take(5)
            .map(|pattern| FrequentError {
                signature: pattern.signature.to_string(),
                count: pattern.count,
            })
            .collect();

        Self {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: succeeded as f64 / total as f64,
            avg_execution_time_ms: total_ms as f64 / total as f64,
            pattern_count: patterns.len(),
            frequent_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, success: bool, ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            command_id: CommandId::generate(),
            command_name: name.to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
            execution_time_ms: ms,
            executed_at: Utc::now(),
            changes: None,
        }
    }

    #[test]
    fn identical_signatures_share_one_pattern() {
        let mut table = ErrorPatternTable::new(16);
        let sig = ErrorSignature::new("missing_object", "no such object 'Cube'");

        assert_eq!(table.record(sig.clone(), "move_object"), 1);
        assert_eq!(table.record(sig.clone(), "move_object"), 2);
        assert_eq!(table.record(sig, "scale_object"), 3);

        assert_eq!(table.len(), 1);
        let pattern = &table.snapshot()[0];
        assert_eq!(pattern.count, 3);
        assert_eq!(pattern.sample_commands.len(), 2);
    }

    #[test]
    fn message_prefix_bounds_the_key() {
        let long_a = format!("{}{}", "x".repeat(MESSAGE_PREFIX_LEN), "tail one");
        let long_b = format!("{}{}", "x".repeat(MESSAGE_PREFIX_LEN), "different tail");

        let mut table = ErrorPatternTable::new(16);
        table.record(ErrorSignature::new("host_state", &long_a), "a");
        table.record(ErrorSignature::new("host_state", &long_b), "b");

        // Same prefix, same pattern.
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].count, 2);
    }

    #[test]
    fn table_is_bounded_and_evicts_least_recent() {
        let mut table = ErrorPatternTable::new(2);
        table.record(ErrorSignature::new("io", "first"), "a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.record(ErrorSignature::new("io", "second"), "b");
        std::thread::sleep(std::time::Duration::from_millis(2));
        // Refresh "first" so "second" becomes the least recent.
        table.record(ErrorSignature::new("io", "first"), "a");
        std::thread::sleep(std::time::Duration::from_millis(2));

        table.record(ErrorSignature::new("io", "third"), "c");
        assert_eq!(table.len(), 2);

        let kept: Vec<_> = table
            .snapshot()
            .into_iter()
            .map(|p| p.signature.message_prefix)
            .collect();
        assert!(kept.contains(&"first".to_string()));
        assert!(kept.contains(&"third".to_string()));
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut history = ExecutionHistory::new(3);
        for i in 0..5 {
            history.push(record(&format!("cmd-{i}"), true, 1));
        }
        assert_eq!(history.len(), 3);

        let recent = history.recent(10);
        assert_eq!(recent[0].command_name, "cmd-4");
        assert_eq!(recent[2].command_name, "cmd-2");
    }

    #[test]
    fn stats_over_window() {
        let mut history = ExecutionHistory::new(10);
        history.push(record("a", true, 10));
        history.push(record("b", true, 20));
        history.push(record("c", false, 30));

        let mut patterns = ErrorPatternTable::new(16);
        patterns.record(ErrorSignature::new("unknown", "boom"), "c");

        let stats = ExecutionStats::compute(&history, &patterns);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!((stats.avg_execution_time_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(stats.frequent_errors.len(), 1);
    }

    #[test]
    fn empty_stats_are_zeroed() {
        let history = ExecutionHistory::new(10);
        let patterns = ErrorPatternTable::new(16);
        let stats = ExecutionStats::compute(&history, &patterns);
        assert_eq!(stats.total, 0);
        assert!(stats.success_rate.abs() < f64::EPSILON);
    }
}
