//! Time sources and call-id allocation
//!
//! The recorder never reads wall-clock time directly. It is handed a
//! [`Clock`] at construction so that production uses a monotonic source and
//! tests drive time by hand.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │ MonotonicClock               │      │ ManualClock                  │
//! │   Instant origin + elapsed() │      │   AtomicU64, set()/advance() │
//! └──────────────┬───────────────┘      └──────────────┬───────────────┘
//!                └──────────── impl Clock ─────────────┘
//!                                │ now() -> Timestamp (ns)
//!                                ▼
//!                          CallRecorder / Reaper
//! ```
//!
//! Call ids come from a [`CallIdGenerator`] owned by the recorder instance,
//! not from process-wide state, so two recorders in one process never share
//! a counter.

use crate::call_record::{CallId, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source in nanoseconds
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Production clock: nanoseconds elapsed since construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        // u64 nanoseconds cover ~584 years of uptime
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Hand-driven clock for tests and replay
///
/// # Example
///
/// ```
/// use fansy_tracer::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(500);
/// assert_eq!(clock.now(), 1_500);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, at: Timestamp) {
        self.now.store(at, Ordering::SeqCst);
    }

    pub fn advance(&self, by: u64) -> Timestamp {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Lock-free allocator of process-unique call ids
///
/// Ids start at 1 so that 0 never names a real call.
#[derive(Debug)]
pub struct CallIdGenerator {
    counter: AtomicU64,
}

impl CallIdGenerator {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CallId {
        CallId(self.counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed) - 1
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
