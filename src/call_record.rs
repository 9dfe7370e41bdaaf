//! Call record schema for instrumented FANSY-SCRIPT invocations
//!
//! Each invocation observed by the instrumentation shim becomes one
//! [`CallRecord`]. Records reference their parent by id rather than embedding
//! children, so a call tree is a flat map plus child-id lists.
//!
//! # Lifecycle
//!
//! ```text
//!   start event ──► InFlight ──► Success / Failure          (end event)
//!                      │
//!                      └──────► Abandoned(Unwind | Stale)   (ancestor ended / reaper)
//! ```
//!
//! A record leaves `InFlight` exactly once and is never reopened.

use crate::function_def::FunctionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds on the recorder's monotonic clock
pub type Timestamp = u64;

/// Process-unique call identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an in-flight call was forcibly closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// An ancestor frame ended first (exception short-circuit)
    Unwind,
    /// In flight longer than the staleness threshold
    Stale,
}

/// Outcome of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    InFlight,
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Failure {
        error: String,
    },
    Abandoned {
        reason: AbandonReason,
    },
}

impl CallOutcome {
    pub fn success() -> Self {
        CallOutcome::Success { result: None }
    }

    pub fn success_with(result: impl Into<String>) -> Self {
        CallOutcome::Success {
            result: Some(result.into()),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        CallOutcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallOutcome::InFlight)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, CallOutcome::Abandoned { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CallOutcome::Failure { .. })
    }
}

/// One invocation of a FANSY-SCRIPT function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub function: FunctionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CallId>,
    /// Label of the execution context that issued the call
    pub context: String,
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
    /// Argument values or opaque references, in call order
    pub params: Vec<String>,
    pub outcome: CallOutcome,
    /// Ids of calls started with this call as parent, in start order
    #[serde(default)]
    pub children: Vec<CallId>,
}

impl CallRecord {
    /// `end - start`, or `None` while in flight
    pub fn duration(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_in_flight(&self) -> bool {
        !self.outcome.is_terminal()
    }
}

/// Event accepted by the call store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Start {
        call_id: CallId,
        function: FunctionId,
        parent: Option<CallId>,
        context: String,
        at: Timestamp,
        params: Vec<String>,
    },
    End {
        call_id: CallId,
        at: Timestamp,
        outcome: CallOutcome,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> CallId {
        match self {
            CallEvent::Start { call_id, .. } | CallEvent::End { call_id, .. } => *call_id,
        }
    }
}
