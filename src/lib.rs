//! fansy-tracer - call tracing and signature drift analysis for FANSY-SCRIPT
//!
//! Two independent halves share only function identity (module + name):
//!
//! - Runtime: [`recorder::CallRecorder`] turns call start/end notifications
//!   from the interpreter into [`call_record::CallRecord`] trees held by the
//!   [`call_store::CallStore`], which keeps per-function statistics current.
//! - Static: [`analyzer::analyze`] extracts call sites from stored function
//!   bodies, builds the caller → callee [`dependency_graph::DependencyGraph`]
//!   and reports call sites whose argument count no longer matches the
//!   callee's signature.

pub mod analyzer;
pub mod call_record;
pub mod call_store;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dependency_graph;
pub mod drift;
pub mod error_log;
pub mod extractor;
pub mod function_def;
pub mod reaper;
pub mod recorder;
pub mod report;
pub mod signature;
pub mod stats;
