use chrono::{SecondsFormat, Utc};
use polyglot_common::types::{ExecutionResult, HistoryEntry, MetricsSnapshot};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

/// Maximum number of executions kept in history
pub const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Default)]
struct Counters {
    executions: u64,
    errors: u64,
    total_execution_time_ms: u64,
}

#[derive(Debug)]
struct LedgerState {
    history: VecDeque<HistoryEntry>,
    counters: Counters,
}

/// Bounded execution history plus aggregate counters.
///
/// History and counters live behind one lock so a reader never sees an
/// entry whose execution is not yet counted. Clearing history leaves the
/// counters alone; they only ever grow.
#[derive(Debug)]
pub struct Ledger {
    capacity: usize,
    state: Mutex<LedgerState>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LedgerState {
                history: VecDeque::with_capacity(capacity),
                counters: Counters::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(&self, result: &ExecutionResult, code: &str) {
        let entry = HistoryEntry {
            result: result.clone(),
            code: code.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let mut state = self.state.lock().await;
        state.counters.executions += 1;
        if !result.success {
            state.counters.errors += 1;
        }
        state.counters.total_execution_time_ms += result.execution_time_ms;

        state.history.push_front(entry);
        while state.history.len() > self.capacity {
            state.history.pop_back();
        }
        debug!(
            execution_id = %result.execution_id,
            history_len = state.history.len(),
            "Execution recorded"
        );
    }

    /// Up to `limit` entries, newest first
    pub async fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let state = self.state.lock().await;
        state.history.iter().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.history.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.history.is_empty()
    }

    /// Drop all history entries; returns how many were removed
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.history.len();
        state.history.clear();
        removed
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        let c = &state.counters;
        let average = if c.executions == 0 {
            0.0
        } else {
            c.total_execution_time_ms as f64 / c.executions as f64
        };
        MetricsSnapshot {
            executions: c.executions,
            errors: c.errors,
            total_execution_time_ms: c.total_execution_time_ms,
            average_execution_time_ms: average,
        }
    }
}
