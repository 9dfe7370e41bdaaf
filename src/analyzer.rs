//! On-demand analysis pass: graph, cycles, drift findings
//!
//! A pass never fails as a whole. A body whose delimiters never balance is
//! listed under `needs_review` and degrades only its own findings; a stored
//! row whose head can't be parsed is skipped with a warning.

use crate::config::AnalysisConfig;
use crate::dependency_graph::DependencyGraph;
use crate::drift::{detect, Confidence, DriftFinding};
use crate::function_def::{FunctionDefinition, FunctionId, HeaderParseError, StoredFunctionRow};
use crate::signature::SignatureHistory;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Result of one analysis pass
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub analyzed_at: DateTime<Utc>,
    pub graph: DependencyGraph,
    pub history: SignatureHistory,
    pub cycles: Vec<Vec<FunctionId>>,
    pub findings: Vec<DriftFinding>,
    /// Functions with at least one unbalanced call site
    pub needs_review: Vec<FunctionId>,
}

impl AnalysisReport {
    pub fn count_by_confidence(&self) -> BTreeMap<Confidence, usize> {
        let mut counts = BTreeMap::new();
        for f in &self.findings {
            *counts.entry(f.confidence).or_insert(0) += 1;
        }
        counts
    }

    /// Findings where `function` is the caller or the callee
    pub fn findings_for<'r>(
        &'r self,
        function: &'r FunctionId,
    ) -> impl Iterator<Item = &'r DriftFinding> + 'r {
        self.findings
            .iter()
            .filter(move |f| &f.caller == function || &f.callee == function)
    }

    pub fn has_definite(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.confidence == Confidence::Definite)
    }
}

/// Run a full pass over every known revision
///
/// `definitions` holds current and superseded revisions alike; the graph is
/// built from the revision of each function in effect at `now`, drift is
/// judged against the whole history.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use fansy_tracer::analyzer::analyze;
/// use fansy_tracer::config::AnalysisConfig;
/// use fansy_tracer::drift::Confidence;
/// use fansy_tracer::function_def::{FunctionDefinition, FunctionId, Parameter};
///
/// let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
/// let defs = vec![
///     FunctionDefinition::new(
///         FunctionId::new("M", "Rate"),
///         vec![Parameter::required("date"), Parameter::required("currency")],
///         "",
///         at,
///     ),
///     FunctionDefinition::new(FunctionId::new("M", "Doc"), vec![], "Rate(d);", at),
/// ];
/// let report = analyze(&defs, &AnalysisConfig::default(), at);
/// assert_eq!(report.findings.len(), 1);
/// assert_eq!(report.findings[0].confidence, Confidence::Definite);
/// ```
pub fn analyze(
    definitions: &[FunctionDefinition],
    config: &AnalysisConfig,
    now: DateTime<Utc>,
) -> AnalysisReport {
    let graph = DependencyGraph::build(definitions, now);
    let history = SignatureHistory::from_definitions(definitions);
    let cycles = graph.find_cycles(config.max_cycle_len, config.max_cycles);
    let findings = detect(&graph, &history, now);

    let needs_review: Vec<FunctionId> = graph.needs_review().into_iter().cloned().collect();
    for function in &needs_review {
        let unresolved = graph
            .sites_of(function)
            .iter()
            .filter(|s| !s.site.is_resolved())
            .count();
        tracing::warn!(%function, unresolved, "Unbalanced call sites, manual review needed");
    }

    tracing::debug!(
        revisions = definitions.len(),
        functions = graph.node_count(),
        cycles = cycles.len(),
        findings = findings.len(),
        "Analysis complete"
    );

    AnalysisReport {
        analyzed_at: now,
        graph,
        history,
        cycles,
        findings,
        needs_review,
    }
}

/// Parse raw metadata-store rows, skipping rows whose head is malformed
pub fn definitions_from_rows(
    rows: &[StoredFunctionRow],
) -> (Vec<FunctionDefinition>, Vec<HeaderParseError>) {
    let mut definitions = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();
    for row in rows {
        match FunctionDefinition::from_row(row) {
            Ok(def) => definitions.push(def),
            Err(e) => {
                tracing::warn!(module = %row.module, error = %e, "Skipping function row");
                errors.push(e);
            }
        }
    }
    (definitions, errors)
}
