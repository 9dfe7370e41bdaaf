//! Signature drift detection
//!
//! Every call site backing a graph edge is checked against the signature of
//! its callee in effect at `now`. A module-qualified site whose target is
//! not in the function set is reported too: the qualifier names a stored
//! function, so it cannot be an interpreter builtin. Unqualified unknown
//! names stay external.
//!
//! | Situation                                          | Confidence      |
//! |----------------------------------------------------|-----------------|
//! | `MODULE->Name` target that is not a known function | `Indeterminate` |
//! | argument list never balanced                       | `Indeterminate` |
//! | callee has no signature in effect                  | `Indeterminate` |
//! | count within `required..=declared`                 | no finding      |
//! | count fits the previous signature, not the current | `Heuristic`     |
//! | count below required                               | `Definite`      |
//! | count above declared                               | `Definite`      |
//!
//! A previous signature only ever lowers confidence: a caller that still
//! matches the old shape is most likely not migrated yet, which is reported
//! as such rather than as breakage. Without history nothing is guessed.
//!
//! Only arity is compared. Argument order cannot be recovered from the text.

use crate::dependency_graph::DependencyGraph;
use crate::extractor::Arity;
use crate::function_def::FunctionId;
use crate::signature::SignatureHistory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How sure a finding is; orders definite first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Definite,
    Heuristic,
    Indeterminate,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Confidence::Definite => "definite",
            Confidence::Heuristic => "heuristic",
            Confidence::Indeterminate => "indeterminate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Fewer arguments than required parameters
    MissingRequired,
    /// More arguments than declared parameters
    ExcessArguments,
    /// Arguments match the previous signature, not the current one
    StaleSignature,
    /// Argument count could not be parsed
    UnresolvedCallSite,
    /// Callee has no signature in effect
    NoSignature,
    /// `MODULE->Name` target missing from the function set
    UnknownCallee,
}

/// One suspicious call site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub confidence: Confidence,
    pub kind: DriftKind,
    pub caller: FunctionId,
    pub callee: FunctionId,
    pub ordinal: usize,
    pub line: usize,
    /// Arguments at the call site, absent when unresolved
    pub found: Option<usize>,
    /// Required parameters of the current signature
    pub required: Option<usize>,
    /// Declared parameters of the current signature
    pub declared: Option<usize>,
    /// Declared parameters of the previous signature
    pub previous: Option<usize>,
    pub message: String,
}

/// Compare every resolved call site with its callee's signature at `now`
///
/// Findings are sorted by confidence, then callee name, then caller name,
/// then ordinal.
pub fn detect(
    graph: &DependencyGraph,
    history: &SignatureHistory,
    now: DateTime<Utc>,
) -> Vec<DriftFinding> {
    let mut findings = Vec::new();

    for (caller, resolved) in graph.sites() {
        let site = &resolved.site;
        let Some(callee) = &resolved.callee else {
            if let Some(module) = &site.qualifier {
                findings.push(DriftFinding {
                    confidence: Confidence::Indeterminate,
                    kind: DriftKind::UnknownCallee,
                    caller: caller.clone(),
                    callee: FunctionId::new(module.clone(), site.callee.clone()),
                    ordinal: site.ordinal,
                    line: site.line,
                    found: site.arity.count(),
                    required: None,
                    declared: None,
                    previous: None,
                    message: format!(
                        "{} calls {} at line {}, which is not a known function",
                        caller,
                        site.target(),
                        site.line
                    ),
                });
            }
            continue;
        };
        let current = history.current(callee, now);
        let previous = history.previous(callee, now);

        let finding = |confidence, kind, found: Option<usize>, message: String| DriftFinding {
            confidence,
            kind,
            caller: caller.clone(),
            callee: callee.clone(),
            ordinal: site.ordinal,
            line: site.line,
            found,
            required: current.map(|v| v.required_count),
            declared: current.map(|v| v.param_count),
            previous: previous.map(|v| v.param_count),
            message,
        };

        let count = match site.arity {
            Arity::Resolved(n) => n,
            Arity::Unresolved => {
                findings.push(finding(
                    Confidence::Indeterminate,
                    DriftKind::UnresolvedCallSite,
                    None,
                    format!(
                        "{} calls {} at line {} with an unbalanced argument list",
                        caller, callee, site.line
                    ),
                ));
                continue;
            }
        };

        let Some(version) = current else {
            findings.push(finding(
                Confidence::Indeterminate,
                DriftKind::NoSignature,
                Some(count),
                format!("{} has no signature in effect", callee),
            ));
            continue;
        };

        if version.accepts(count) {
            continue;
        }

        if let Some(prev) = previous.filter(|p| p.accepts(count)) {
            findings.push(finding(
                Confidence::Heuristic,
                DriftKind::StaleSignature,
                Some(count),
                format!(
                    "{} passes {} arguments to {}, matching the signature before {} ({} params) but not the current one ({} params)",
                    caller,
                    count,
                    callee,
                    version.effective_from.format("%Y-%m-%d"),
                    prev.param_count,
                    version.param_count
                ),
            ));
            continue;
        }

        if count < version.required_count {
            findings.push(finding(
                Confidence::Definite,
                DriftKind::MissingRequired,
                Some(count),
                format!(
                    "{} passes {} arguments to {}, which requires {}",
                    caller, count, callee, version.required_count
                ),
            ));
        } else {
            findings.push(finding(
                Confidence::Definite,
                DriftKind::ExcessArguments,
                Some(count),
                format!(
                    "{} passes {} arguments to {}, which declares {}",
                    caller, count, callee, version.param_count
                ),
            ));
        }
    }

    sort_findings(&mut findings);
    findings
}

/// Deterministic report order
pub fn sort_findings(findings: &mut [DriftFinding]) {
    findings.sort_by(|a, b| {
        a.confidence
            .cmp(&b.confidence)
            .then_with(|| a.callee.name.cmp(&b.callee.name))
            .then_with(|| a.callee.module.cmp(&b.callee.module))
            .then_with(|| a.caller.name.cmp(&b.caller.name))
            .then_with(|| a.caller.module.cmp(&b.caller.module))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
}
