//! Instrumentation entry point: "a call started" / "a call ended"
//!
//! One [`CallRecorder`] exists per running interpreter and is passed by
//! reference to every instrumentation shim. Each document being processed
//! owns an [`ExecutionContext`] holding its logical call stack; the stack is
//! never shared, so only the [`CallStore`] behind the recorder needs a lock.
//!
//! # Stack discipline
//!
//! ```text
//!   start A        start B        start C        end A
//!   [A]       →    [A, B]    →    [A, B, C] →    []
//!                                               C: abandoned (unwind)
//!                                               B: abandoned (unwind)
//!                                               A: caller's outcome
//! ```
//!
//! Ending a frame that is not on top (an exception skipped the intermediate
//! ends) force-closes the frames above it that descend from it, so the
//! recorded tree keeps its shape instead of leaving orphaned in-flight calls
//! behind. Frames above it that were started under an explicit outer parent
//! are not its descendants and stay open.
//!
//! A context remembers the ids of its open frames and of the last
//! [`ENDED_IDS_RETAINED`] ended ones, so a long-lived context stays bounded.
//! Ending an id older than that reports [`RecorderError::UnknownCall`].
//!
//! Misuse by the shim (unknown id, double end, bogus parent) is returned as a
//! [`RecorderError`]; the recorder never panics and never aborts the host.

use crate::call_record::{AbandonReason, CallEvent, CallId, CallOutcome};
use crate::call_store::{CallStore, RecordOutcome};
use crate::clock::{CallIdGenerator, Clock, MonotonicClock};
use crate::config::ReaperConfig;
use crate::function_def::FunctionId;
use crate::reaper::Reaper;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Ended call ids a context keeps for double-end detection
pub const ENDED_IDS_RETAINED: usize = 1024;

/// Instrumentation misuse reported to the shim
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("parent call {parent} is not in flight in context '{context}'")]
    InvalidParent { parent: CallId, context: String },

    #[error("call {call} was never started in context '{context}'")]
    UnknownCall { call: CallId, context: String },

    #[error("call {call} already ended in context '{context}'")]
    AlreadyEnded { call: CallId, context: String },
}

/// How a call finished, as reported by the shim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success { result: Option<String> },
    Failure { error: String },
}

impl Completion {
    pub fn success() -> Self {
        Completion::Success { result: None }
    }

    pub fn returned(result: impl Into<String>) -> Self {
        Completion::Success {
            result: Some(result.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Completion::Failure {
            error: error.into(),
        }
    }
}

impl From<Completion> for CallOutcome {
    fn from(completion: Completion) -> Self {
        match completion {
            Completion::Success { result } => CallOutcome::Success { result },
            Completion::Failure { error } => CallOutcome::Failure { error },
        }
    }
}

/// Logical thread of control (one document's processing)
#[derive(Debug)]
pub struct ExecutionContext {
    label: String,
    stack: Vec<CallId>,
    /// Open frame -> its parent
    open: FnvHashMap<CallId, Option<CallId>>,
    ended: FnvHashSet<CallId>,
    ended_order: VecDeque<CallId>,
}

impl ExecutionContext {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            stack: Vec::new(),
            open: FnvHashMap::default(),
            ended: FnvHashSet::default(),
            ended_order: VecDeque::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of frames currently open
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Innermost open call
    pub fn current(&self) -> Option<CallId> {
        self.stack.last().copied()
    }

    pub fn is_open(&self, call_id: CallId) -> bool {
        self.open.contains_key(&call_id)
    }

    /// Ids the context remembers: open frames plus recently ended ones
    pub fn tracked(&self) -> usize {
        self.open.len() + self.ended.len()
    }

    /// Whether open frame `call_id` was started (transitively) under `ancestor`
    fn descends_from(&self, call_id: CallId, ancestor: CallId) -> bool {
        let mut next = self.open.get(&call_id).copied().flatten();
        while let Some(parent) = next {
            if parent == ancestor {
                return true;
            }
            next = self.open.get(&parent).copied().flatten();
        }
        false
    }

    fn mark_ended(&mut self, call_id: CallId) {
        self.open.remove(&call_id);
        if self.ended.insert(call_id) {
            self.ended_order.push_back(call_id);
        }
        while self.ended_order.len() > ENDED_IDS_RETAINED {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
    }
}

/// Records nested invocations into a shared [`CallStore`]
///
/// # Example
///
/// ```
/// use fansy_tracer::call_store::CallStore;
/// use fansy_tracer::clock::ManualClock;
/// use fansy_tracer::config::StoreConfig;
/// use fansy_tracer::function_def::FunctionId;
/// use fansy_tracer::recorder::{CallRecorder, Completion, ExecutionContext};
/// use std::sync::Arc;
///
/// let store = Arc::new(CallStore::new(&StoreConfig::default()));
/// let recorder = CallRecorder::new(store.clone(), Arc::new(ManualClock::new(0)));
/// let mut ctx = ExecutionContext::new("doc-42");
///
/// let body = recorder
///     .start_call(&mut ctx, FunctionId::new("_F_SPECTRE", "OP_P_NDFL_PRC_BODY"), None, vec![])
///     .unwrap();
/// let rate = recorder
///     .start_call(&mut ctx, FunctionId::new("_F_BUX", "Get_Rate"), None, vec![])
///     .unwrap();
/// recorder.end_call(&mut ctx, rate, Completion::returned("92.5")).unwrap();
/// recorder.end_call(&mut ctx, body, Completion::success()).unwrap();
///
/// assert_eq!(store.get(rate).unwrap().parent, Some(body));
/// ```
pub struct CallRecorder {
    store: Arc<CallStore>,
    clock: Arc<dyn Clock>,
    ids: CallIdGenerator,
}

impl std::fmt::Debug for CallRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRecorder")
            .field("store", &self.store.store_stats())
            .field("issued", &self.ids.issued())
            .finish()
    }
}

impl CallRecorder {
    pub fn new(store: Arc<CallStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ids: CallIdGenerator::new(),
        }
    }

    pub fn with_monotonic_clock(store: Arc<CallStore>) -> Self {
        Self::new(store, Arc::new(MonotonicClock::new()))
    }

    pub fn store(&self) -> &Arc<CallStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Start the stale-call sweep for this recorder's store
    pub fn start_reaper(&self, config: &ReaperConfig) -> Reaper {
        Reaper::start(self.store.clone(), self.clock.clone(), config)
    }

    /// Record the start of a call
    ///
    /// With no explicit `parent`, the call nests under the innermost open
    /// frame of `ctx` (if any).
    ///
    /// # Errors
    ///
    /// [`RecorderError::InvalidParent`] if `parent` is given and is not an
    /// open frame of `ctx`.
    pub fn start_call(
        &self,
        ctx: &mut ExecutionContext,
        function: FunctionId,
        parent: Option<CallId>,
        params: Vec<String>,
    ) -> Result<CallId, RecorderError> {
        if let Some(parent_id) = parent {
            if !ctx.is_open(parent_id) {
                return Err(RecorderError::InvalidParent {
                    parent: parent_id,
                    context: ctx.label.clone(),
                });
            }
        }
        let parent = parent.or_else(|| ctx.current());

        let call_id = self.ids.next_id();
        let outcome = self.store.record(CallEvent::Start {
            call_id,
            function,
            parent,
            context: ctx.label.clone(),
            at: self.clock.now(),
            params,
        });
        if outcome == RecordOutcome::Dropped {
            tracing::debug!(call = %call_id, context = %ctx.label, "Start not retained by store");
        }

        ctx.stack.push(call_id);
        ctx.open.insert(call_id, parent);
        Ok(call_id)
    }

    /// Record the end of a call
    ///
    /// Returns the ids force-closed as `Abandoned(Unwind)` because they were
    /// still open above `call_id` and descend from it, innermost first.
    ///
    /// # Errors
    ///
    /// - [`RecorderError::UnknownCall`] if `call_id` was never started in `ctx`
    /// - [`RecorderError::AlreadyEnded`] if it was already closed
    pub fn end_call(
        &self,
        ctx: &mut ExecutionContext,
        call_id: CallId,
        completion: Completion,
    ) -> Result<Vec<CallId>, RecorderError> {
        if !ctx.is_open(call_id) {
            let context = ctx.label.clone();
            return Err(if ctx.ended.contains(&call_id) {
                RecorderError::AlreadyEnded {
                    call: call_id,
                    context,
                }
            } else {
                RecorderError::UnknownCall {
                    call: call_id,
                    context,
                }
            });
        }

        let now = self.clock.now();
        let unwound: Vec<CallId> = match ctx.stack.iter().rposition(|id| *id == call_id) {
            Some(pos) => {
                let above = ctx.stack.split_off(pos + 1);
                ctx.stack.pop();
                let (inner, unrelated): (Vec<CallId>, Vec<CallId>) = above
                    .into_iter()
                    .partition(|id| ctx.descends_from(*id, call_id));
                ctx.stack.extend(unrelated);
                inner.into_iter().rev().collect()
            }
            None => Vec::new(),
        };
        for id in &unwound {
            self.close(ctx, *id, now, CallOutcome::Abandoned {
                reason: AbandonReason::Unwind,
            });
        }
        if !unwound.is_empty() {
            tracing::warn!(
                call = %call_id,
                context = %ctx.label,
                unwound = unwound.len(),
                "Out-of-order end: force-closed inner frames"
            );
        }

        self.close(ctx, call_id, now, completion.into());
        Ok(unwound)
    }

    /// Abandon every frame still open in `ctx` (document processing aborted)
    ///
    /// Returns the closed ids, innermost first.
    pub fn finish_context(&self, mut ctx: ExecutionContext) -> Vec<CallId> {
        let now = self.clock.now();
        let open: Vec<CallId> = ctx.stack.drain(..).rev().collect();
        for id in &open {
            self.close(&mut ctx, *id, now, CallOutcome::Abandoned {
                reason: AbandonReason::Unwind,
            });
        }
        if !open.is_empty() {
            tracing::warn!(context = %ctx.label, open = open.len(), "Context finished with open frames");
        }
        open
    }

    fn close(&self, ctx: &mut ExecutionContext, call_id: CallId, at: u64, outcome: CallOutcome) {
        ctx.mark_ended(call_id);
        self.store.record(CallEvent::End {
            call_id,
            at,
            outcome,
        });
    }
}
