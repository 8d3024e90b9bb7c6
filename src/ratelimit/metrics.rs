//! Decision metrics for observers.
//!
//! [`Metrics`] is owned by the engine and handed out as a cheap clone to
//! whatever polls it (a dashboard, a log line). All counters live behind one
//! lock that only metrics code takes, so a [`MetricsSnapshot`] is always an
//! internally consistent copy: the totals equal the per-key sums of the live
//! keys plus whatever was recorded for keys since evicted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use super::key::RateLimitKey;
use super::strategy::{Decision, Outcome};

/// Default number of recent decisions kept for display.
pub const DEFAULT_HISTORY_SIZE: usize = 20;

/// Admission counts for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyCounts {
    pub admitted: u64,
    pub rejected: u64,
}

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub at: DateTime<Utc>,
    pub key: RateLimitKey,
    pub outcome: Outcome,
    pub cost: u64,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

/// A point-in-time copy of all metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Total decisions that admitted the request
    pub total_admitted: u64,
    /// Total decisions that rejected the request, including invalid costs
    pub total_rejected: u64,
    /// Rejections caused by a cost that can never be admitted
    pub total_invalid: u64,
    /// Keys whose limiter state was dropped by eviction or reset
    pub keys_evicted: u64,
    /// Counts for keys that are currently tracked
    pub per_key: BTreeMap<RateLimitKey, KeyCounts>,
    /// Most recent decisions, oldest first
    pub recent: Vec<DecisionRecord>,
}

impl MetricsSnapshot {
    /// Total number of decisions made.
    pub fn total_decisions(&self) -> u64 {
        self.total_admitted.saturating_add(self.total_rejected)
    }

    /// Ratio of rejected decisions (0.0 to 1.0), 0.0 when nothing was decided.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_decisions();
        if total == 0 {
            0.0
        } else {
            self.total_rejected as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_admitted: u64,
    total_rejected: u64,
    total_invalid: u64,
    keys_evicted: u64,
    per_key: HashMap<RateLimitKey, KeyCounts>,
    recent: VecDeque<DecisionRecord>,
}

/// Engine-scoped decision metrics.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<Mutex<MetricsState>>,
    history_size: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_SIZE)
    }

    /// Create metrics that keep the last `history_size` decisions.
    pub fn with_history(history_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::default())),
            history_size,
        }
    }

    /// Record the outcome of one decision for `key`.
    pub(crate) fn record(&self, key: &RateLimitKey, cost: u64, decision: &Decision) {
        let record = (self.history_size > 0).then(|| DecisionRecord {
            at: Utc::now(),
            key: key.clone(),
            outcome: decision.outcome,
            cost,
            remaining: decision.remaining,
            retry_after_ms: decision.retry_after.as_millis() as u64,
        });

        let mut state = self.inner.lock();
        let admitted = decision.is_admitted();
        if admitted {
            state.total_admitted += 1;
        } else {
            state.total_rejected += 1;
        }
        if decision.outcome == Outcome::InvalidCost {
            state.total_invalid += 1;
        }

        let counts = state.per_key.entry(key.clone()).or_default();
        if admitted {
            counts.admitted += 1;
        } else {
            counts.rejected += 1;
        }

        if let Some(record) = record {
            if state.recent.len() == self.history_size {
                state.recent.pop_front();
            }
            state.recent.push_back(record);
        }
    }

    /// Count `evicted` registry keys and drop per-key counters for keys that fail `keep`.
    pub(crate) fn record_evictions<F>(&self, evicted: usize, mut keep: F)
    where
        F: FnMut(&RateLimitKey) -> bool,
    {
        let mut state = self.inner.lock();
        state.keys_evicted += evicted as u64;
        state.per_key.retain(|key, _| keep(key));
    }

    /// Take a consistent copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock();
        MetricsSnapshot {
            taken_at: Utc::now(),
            total_admitted: state.total_admitted,
            total_rejected: state.total_rejected,
            total_invalid: state.total_invalid,
            keys_evicted: state.keys_evicted,
            per_key: state
                .per_key
                .iter()
                .map(|(key, counts)| (key.clone(), *counts))
                .collect(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    /// Reset all metrics to zero.
    ///
    /// Meant for test isolation; production observers should diff snapshots.
    pub fn reset(&self) {
        *self.inner.lock() = MetricsState::default();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
