//! Per-function call statistics
//!
//! Counters are folded in one terminal [`CallRecord`] at a time, so a snapshot
//! never rescans the call history. Latency uses Welford's online algorithm
//! (running count / mean / M2) and keeps no per-sample storage.
//!
//! Abandoned calls are counted separately and never touch the latency
//! accumulator: their durations measure when the ancestor failed or when the
//! reaper ran, not how long the function took.

use crate::call_record::{CallOutcome, CallRecord};
use crate::function_def::FunctionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Online latency accumulator (nanoseconds)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean
    m2: f64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub total: u64,
}

impl LatencyStats {
    pub fn observe(&mut self, sample: u64) {
        self.count += 1;
        self.total = self.total.saturating_add(sample);
        let x = sample as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    /// Population variance, 0 for fewer than two samples
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Statistics for a single function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionStats {
    /// Terminal calls of any outcome
    pub total_calls: u64,
    pub success_calls: u64,
    pub error_calls: u64,
    /// Closed by unwind or by the reaper; excluded from `latency`
    pub abandoned_calls: u64,
    pub latency: LatencyStats,
}

impl FunctionStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.error_calls as f64 / self.total_calls as f64
        }
    }
}

/// Summary totals across all functions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatTotals {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_abandoned: u64,
    pub total_time_ns: u64,
}

/// Consistent copy of the aggregate counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub functions: HashMap<FunctionId, FunctionStats>,
}

impl StatsSnapshot {
    pub fn get(&self, function: &FunctionId) -> Option<&FunctionStats> {
        self.functions.get(function)
    }

    /// All functions ordered by identity
    pub fn entries(&self) -> Vec<(&FunctionId, &FunctionStats)> {
        let mut entries: Vec<_> = self.functions.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn totals(&self) -> StatTotals {
        self.functions
            .values()
            .fold(StatTotals::default(), |mut acc, s| {
                acc.total_calls += s.total_calls;
                acc.total_errors += s.error_calls;
                acc.total_abandoned += s.abandoned_calls;
                acc.total_time_ns = acc.total_time_ns.saturating_add(s.latency.total);
                acc
            })
    }

    /// Functions sorted by mean latency, slowest first (ties by identity)
    pub fn slowest(&self, limit: usize) -> Vec<(&FunctionId, &FunctionStats)> {
        let mut sorted: Vec<_> = self
            .functions
            .iter()
            .filter(|(_, s)| s.latency.count > 0)
            .collect();
        sorted.sort_by(|a, b| {
            b.1.latency
                .mean
                .partial_cmp(&a.1.latency.mean)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        sorted.truncate(limit);
        sorted
    }
}

/// Folds terminal call records into per-function counters
#[derive(Debug, Default)]
pub struct StatsAggregator {
    stats: HashMap<FunctionId, FunctionStats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one call that just became terminal
    ///
    /// In-flight records are ignored.
    pub fn observe(&mut self, record: &CallRecord) {
        if record.is_in_flight() {
            return;
        }

        let entry = self.stats.entry(record.function.clone()).or_default();
        entry.total_calls += 1;
        match &record.outcome {
            CallOutcome::Abandoned { .. } => {
                entry.abandoned_calls += 1;
                return;
            }
            CallOutcome::Failure { .. } => entry.error_calls += 1,
            CallOutcome::Success { .. } => entry.success_calls += 1,
            CallOutcome::InFlight => {}
        }
        if let Some(duration) = record.duration() {
            entry.latency.observe(duration);
        }
    }

    pub fn get(&self, function: &FunctionId) -> Option<&FunctionStats> {
        self.stats.get(function)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            functions: self.stats.clone(),
        }
    }

    /// Clear every counter (operator request only)
    pub fn reset(&mut self) {
        self.stats.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}
