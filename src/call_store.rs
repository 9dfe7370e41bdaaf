//! Shared ledger of call events with per-function and per-tree indexes
//!
//! The store is the only mutable state shared between execution contexts.
//! Every mutation happens under one short-held lock; nothing inside the lock
//! does I/O, and reads copy what they need out instead of holding the lock
//! across a scan.
//!
//! # Design
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ EXECUTION CONTEXTS (many threads)                              │
//! │   CallRecorder::start_call / end_call → store.record(event)    │
//! └────────────────────────────────────────────────────────────────┘
//!                          │  Mutex<Ledger> (bounded critical section)
//!                          ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │ LEDGER                                                         │
//! │   records:      CallId → CallRecord                            │
//! │   by_function:  FunctionId → {(start, CallId)} (ordered set)   │
//! │   in_flight:    {CallId}            (≤ max_in_flight)          │
//! │   completed:    [CallId]            (≤ max_records, FIFO)      │
//! │   stats:        StatsAggregator     (updated before return)    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backpressure
//!
//! - A start event beyond `max_in_flight` is dropped and counted, never queued.
//! - Past `max_records` completed calls, the oldest completed record is evicted.
//!   In-flight records are never evicted.
//!
//! Stats are folded in synchronously inside `record`, so a reader that sees an
//! end event applied also sees it reflected in [`CallStore::snapshot_stats`].

use crate::call_record::{AbandonReason, CallEvent, CallId, CallOutcome, CallRecord, Timestamp};
use crate::config::StoreConfig;
use crate::function_def::FunctionId;
use crate::stats::{FunctionStats, StatsAggregator, StatsSnapshot};
use fnv::{FnvHashMap, FnvHashSet};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What `record` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied,
    /// Start event refused because too many calls are in flight
    Dropped,
    /// Event refers to a call the store does not track (dropped start,
    /// duplicate start, or a call already closed)
    Ignored,
}

/// Store health counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub retained: usize,
    pub in_flight: usize,
    pub dropped: u64,
    pub evicted: u64,
    /// End events that arrived after the reaper had abandoned the call
    pub late_ends: u64,
    pub max_records: usize,
    pub max_in_flight: usize,
}

impl StoreStats {
    /// Fraction of start events dropped (0.0 to 1.0) relative to `started`
    pub fn drop_rate(&self, started: u64) -> f64 {
        if started == 0 {
            0.0
        } else {
            self.dropped as f64 / started as f64
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    records: FnvHashMap<CallId, CallRecord>,
    /// Start-ordered index; removal by key keeps eviction logarithmic
    by_function: HashMap<FunctionId, BTreeSet<(Timestamp, CallId)>>,
    in_flight: FnvHashSet<CallId>,
    completed: VecDeque<CallId>,
    stats: StatsAggregator,
}

impl Ledger {
    fn finalize(&mut self, call_id: CallId, at: Timestamp, outcome: CallOutcome) {
        let Some(record) = self.records.get_mut(&call_id) else {
            return;
        };
        record.end = Some(at.max(record.start));
        record.outcome = outcome;
        self.stats.observe(record);
        self.in_flight.remove(&call_id);
        self.completed.push_back(call_id);
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(call_id) = self.completed.pop_front() else {
            return false;
        };
        if let Some(record) = self.records.remove(&call_id) {
            if let Some(ids) = self.by_function.get_mut(&record.function) {
                ids.remove(&(record.start, call_id));
                if ids.is_empty() {
                    self.by_function.remove(&record.function);
                }
            }
        }
        true
    }
}

/// Thread-safe call ledger
///
/// # Example
///
/// ```
/// use fansy_tracer::call_record::{CallEvent, CallId, CallOutcome};
/// use fansy_tracer::call_store::{CallStore, RecordOutcome};
/// use fansy_tracer::config::StoreConfig;
/// use fansy_tracer::function_def::FunctionId;
///
/// let store = CallStore::new(&StoreConfig::default());
/// let f = FunctionId::new("_F_BUX", "Get_Rate");
///
/// store.record(CallEvent::Start {
///     call_id: CallId(1),
///     function: f.clone(),
///     parent: None,
///     context: "doc-1".to_string(),
///     at: 100,
///     params: vec!["01.01.2025".to_string()],
/// });
/// let outcome = store.record(CallEvent::End {
///     call_id: CallId(1),
///     at: 400,
///     outcome: CallOutcome::success(),
/// });
///
/// assert_eq!(outcome, RecordOutcome::Applied);
/// assert_eq!(store.function_stats(&f).unwrap().latency.count, 1);
/// ```
#[derive(Debug)]
pub struct CallStore {
    inner: Mutex<Ledger>,
    max_records: usize,
    max_in_flight: usize,
    dropped: AtomicU64,
    evicted: AtomicU64,
    late_ends: AtomicU64,
}

impl CallStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_limits(config.max_records, config.max_in_flight)
    }

    /// # Panics
    ///
    /// Panics if either limit is 0.
    pub fn with_limits(max_records: usize, max_in_flight: usize) -> Self {
        assert!(max_records > 0, "Call store max_records must be > 0");
        assert!(max_in_flight > 0, "Call store max_in_flight must be > 0");
        Self {
            inner: Mutex::new(Ledger::default()),
            max_records,
            max_in_flight,
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            late_ends: AtomicU64::new(0),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // Ledger state stays consistent even if a holder panicked mid-query
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a start or end event
    pub fn record(&self, event: CallEvent) -> RecordOutcome {
        match event {
            CallEvent::Start {
                call_id,
                function,
                parent,
                context,
                at,
                params,
            } => {
                let mut ledger = self.ledger();
                if ledger.in_flight.len() >= self.max_in_flight {
                    drop(ledger);
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        call = %call_id,
                        function = %function,
                        dropped,
                        "Call store full - start event dropped (backpressure)"
                    );
                    return RecordOutcome::Dropped;
                }
                if ledger.records.contains_key(&call_id) {
                    tracing::warn!(call = %call_id, "Duplicate start event ignored");
                    return RecordOutcome::Ignored;
                }

                if let Some(parent_id) = parent {
                    if let Some(parent_record) = ledger.records.get_mut(&parent_id) {
                        parent_record.children.push(call_id);
                    }
                }

                ledger
                    .by_function
                    .entry(function.clone())
                    .or_default()
                    .insert((at, call_id));

                ledger.in_flight.insert(call_id);
                ledger.records.insert(
                    call_id,
                    CallRecord {
                        call_id,
                        function,
                        parent,
                        context,
                        start: at,
                        end: None,
                        params,
                        outcome: CallOutcome::InFlight,
                        children: Vec::new(),
                    },
                );
                RecordOutcome::Applied
            }
            CallEvent::End {
                call_id,
                at,
                outcome,
            } => {
                let mut ledger = self.ledger();
                let current = ledger.records.get(&call_id).map(|r| r.outcome.clone());
                match current {
                    None => {
                        tracing::debug!(call = %call_id, "End event for untracked call ignored");
                        return RecordOutcome::Ignored;
                    }
                    Some(CallOutcome::InFlight) => {}
                    Some(CallOutcome::Abandoned {
                        reason: AbandonReason::Stale,
                    }) => {
                        drop(ledger);
                        self.late_ends.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(call = %call_id, "End event after call was reaped as stale");
                        return RecordOutcome::Ignored;
                    }
                    Some(_) => {
                        tracing::warn!(call = %call_id, "End event for closed call ignored");
                        return RecordOutcome::Ignored;
                    }
                }

                ledger.finalize(call_id, at, outcome);
                let mut evicted = 0;
                while ledger.completed.len() > self.max_records && ledger.evict_oldest() {
                    evicted += 1;
                }
                drop(ledger);
                if evicted > 0 {
                    self.evicted.fetch_add(evicted, Ordering::Relaxed);
                    tracing::debug!(evicted, "Evicted oldest completed calls");
                }
                RecordOutcome::Applied
            }
        }
    }

    /// Mark every call in flight for at least `staleness` as abandoned
    ///
    /// Returns the abandoned ids, oldest start first.
    pub fn abandon_stale(&self, now: Timestamp, staleness: u64) -> Vec<CallId> {
        let mut ledger = self.ledger();
        let mut stale: Vec<(Timestamp, CallId)> = ledger
            .in_flight
            .iter()
            .filter_map(|id| ledger.records.get(id))
            .filter(|r| now.saturating_sub(r.start) >= staleness)
            .map(|r| (r.start, r.call_id))
            .collect();
        stale.sort();

        for (_, call_id) in &stale {
            ledger.finalize(
                *call_id,
                now,
                CallOutcome::Abandoned {
                    reason: AbandonReason::Stale,
                },
            );
        }
        let mut evicted = 0;
        while ledger.completed.len() > self.max_records && ledger.evict_oldest() {
            evicted += 1;
        }
        drop(ledger);
        self.evicted.fetch_add(evicted, Ordering::Relaxed);

        stale.into_iter().map(|(_, id)| id).collect()
    }

    pub fn get(&self, call_id: CallId) -> Option<CallRecord> {
        self.ledger().records.get(&call_id).cloned()
    }

    pub fn children(&self, call_id: CallId) -> Vec<CallId> {
        self.ledger()
            .records
            .get(&call_id)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    /// Calls of `function`, start timestamp ascending (ties by id)
    ///
    /// The id list is captured now; each record is fetched when the iterator
    /// reaches it, so records evicted meanwhile are skipped. Clone the query
    /// (or call [`CallQuery::rewind`]) to walk it again.
    pub fn query(&self, function: &FunctionId) -> CallQuery<'_> {
        let ids: Vec<CallId> = self
            .ledger()
            .by_function
            .get(function)
            .map(|set| set.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        CallQuery {
            store: self,
            ids,
            pos: 0,
        }
    }

    /// Pre-order walk of the call tree rooted at `root`
    pub fn subtree(&self, root: CallId) -> TreeQuery<'_> {
        TreeQuery {
            store: self,
            root,
            stack: vec![(root, 0)],
        }
    }

    /// In-flight calls, oldest start first
    pub fn active_calls(&self) -> Vec<CallRecord> {
        let ledger = self.ledger();
        let mut active: Vec<CallRecord> = ledger
            .in_flight
            .iter()
            .filter_map(|id| ledger.records.get(id).cloned())
            .collect();
        drop(ledger);
        active.sort_by_key(|r| (r.start, r.call_id));
        active
    }

    /// Most recently completed calls, newest first
    pub fn recent(&self, limit: usize) -> Vec<CallRecord> {
        let ledger = self.ledger();
        ledger
            .completed
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| ledger.records.get(id).cloned())
            .collect()
    }

    /// Completed, non-abandoned calls slower than `threshold` ns, slowest first
    pub fn slow_calls(&self, threshold: u64, limit: usize) -> Vec<CallRecord> {
        let ledger = self.ledger();
        let mut slow: Vec<CallRecord> = ledger
            .completed
            .iter()
            .filter_map(|id| ledger.records.get(id))
            .filter(|r| !r.outcome.is_abandoned())
            .filter(|r| r.duration().is_some_and(|d| d > threshold))
            .cloned()
            .collect();
        drop(ledger);
        slow.sort_by(|a, b| {
            b.duration()
                .cmp(&a.duration())
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        slow.truncate(limit);
        slow
    }

    pub fn function_stats(&self, function: &FunctionId) -> Option<FunctionStats> {
        self.ledger().stats.get(function).cloned()
    }

    /// Copy of every per-function counter
    pub fn snapshot_stats(&self) -> StatsSnapshot {
        self.ledger().stats.snapshot()
    }

    /// Clear aggregate counters; call records are kept
    pub fn reset_stats(&self) {
        self.ledger().stats.reset();
        tracing::debug!("Call statistics reset");
    }

    pub fn store_stats(&self) -> StoreStats {
        let ledger = self.ledger();
        StoreStats {
            retained: ledger.records.len(),
            in_flight: ledger.in_flight.len(),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            late_ends: self.late_ends.load(Ordering::Relaxed),
            max_records: self.max_records,
            max_in_flight: self.max_in_flight,
        }
    }
}

/// Lazy, restartable sequence of one function's calls
#[derive(Debug, Clone)]
pub struct CallQuery<'a> {
    store: &'a CallStore,
    ids: Vec<CallId>,
    pos: usize,
}

impl CallQuery<'_> {
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Number of calls captured when the query was created
    pub fn captured(&self) -> usize {
        self.ids.len()
    }
}

impl Iterator for CallQuery<'_> {
    type Item = CallRecord;

    fn next(&mut self) -> Option<CallRecord> {
        while let Some(id) = self.ids.get(self.pos).copied() {
            self.pos += 1;
            if let Some(record) = self.store.get(id) {
                return Some(record);
            }
        }
        None
    }
}

/// Node yielded by [`TreeQuery`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// 0 for the root
    pub depth: usize,
    pub record: CallRecord,
}

/// Lazy pre-order walk of a call tree
#[derive(Debug, Clone)]
pub struct TreeQuery<'a> {
    store: &'a CallStore,
    root: CallId,
    stack: Vec<(CallId, usize)>,
}

impl TreeQuery<'_> {
    pub fn rewind(&mut self) {
        self.stack = vec![(self.root, 0)];
    }
}

impl Iterator for TreeQuery<'_> {
    type Item = TreeEntry;

    fn next(&mut self) -> Option<TreeEntry> {
        while let Some((id, depth)) = self.stack.pop() {
            let Some(record) = self.store.get(id) else {
                continue;
            };
            self.stack
                .extend(record.children.iter().rev().map(|child| (*child, depth + 1)));
            return Some(TreeEntry { depth, record });
        }
        None
    }
}
