//! Periodic sweep that abandons calls stuck in flight
//!
//! A call whose end event never arrives (the interpreter crashed mid-document,
//! a shim forgot to report) would otherwise stay in flight forever. The reaper
//! runs on its own thread, wakes every `interval`, and marks calls older than
//! `staleness` as `Abandoned(Stale)`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ REAPER THREAD                                            │
//! │   loop {                                                 │
//! │     stop_rx.recv_timeout(interval)  // wakes early on stop│
//! │     store.abandon_stale(clock.now(), staleness)          │
//! │   }                                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The sweep is started and stopped as a unit; there is no per-call cancel.

use crate::call_record::CallId;
use crate::call_store::CallStore;
use crate::clock::Clock;
use crate::config::ReaperConfig;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle to a running sweep thread
///
/// Dropping the handle stops the thread and waits for it.
#[derive(Debug)]
pub struct Reaper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    /// Total calls abandoned by this reaper
    reaped: Arc<AtomicU64>,
    sweeps: Arc<AtomicU64>,
}

impl Reaper {
    /// Spawn the sweep thread
    ///
    /// # Panics
    ///
    /// Panics if `config.interval_ms` is 0.
    pub fn start(store: Arc<CallStore>, clock: Arc<dyn Clock>, config: &ReaperConfig) -> Self {
        assert!(config.interval_ms > 0, "Reaper interval must be > 0");

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let reaped = Arc::new(AtomicU64::new(0));
        let sweeps = Arc::new(AtomicU64::new(0));

        let interval = config.interval();
        let staleness = config.staleness_ns();
        let reaped_clone = reaped.clone();
        let sweeps_clone = sweeps.clone();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let abandoned = sweep_once(&store, clock.as_ref(), staleness);
                    reaped_clone.fetch_add(abandoned.len() as u64, Ordering::Relaxed);
                    sweeps_clone.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        tracing::debug!(
            interval_ms = config.interval_ms,
            staleness_ms = config.staleness_ms,
            "Reaper started"
        );

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            reaped,
            sweeps,
        }
    }

    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Stop the sweep and wait for the thread; returns total calls reaped
    pub fn stop(mut self) -> u64 {
        self.shutdown();
        self.reaped()
    }

    fn shutdown(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Receiver may already be gone if the thread exited
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Reaper thread panicked");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one sweep synchronously
pub fn sweep_once(store: &CallStore, clock: &dyn Clock, staleness: u64) -> Vec<CallId> {
    let abandoned = store.abandon_stale(clock.now(), staleness);
    if !abandoned.is_empty() {
        tracing::warn!(count = abandoned.len(), "Reaped stale in-flight calls");
    }
    abandoned
}
