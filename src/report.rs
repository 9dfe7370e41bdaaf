//! Text and JSON rendering of analysis results and live statistics
//!
//! JSON field names are stable: the dashboard reads them directly.

use crate::analyzer::AnalysisReport;
use crate::call_store::StoreStats;
use crate::dependency_graph::{DependencyEdge, FunctionInfo, GraphStats};
use crate::drift::{Confidence, DriftFinding};
use crate::error_log::Correlation;
use crate::function_def::FunctionId;
use crate::stats::{StatTotals, StatsSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};

/// Number of central functions listed in reports
pub const CENTRAL_LIMIT: usize = 10;

/// Betweenness score of one function
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralFunction {
    pub function: FunctionId,
    pub score: f64,
}

fn central_functions(report: &AnalysisReport) -> Vec<CentralFunction> {
    report
        .graph
        .central_functions(CENTRAL_LIMIT)
        .into_iter()
        .filter(|(_, score)| *score > 0.0)
        .map(|(function, score)| CentralFunction {
            function: function.clone(),
            score,
        })
        .collect()
}

/// Findings by confidence level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JsonFindingCounts {
    pub definite: usize,
    pub heuristic: usize,
    pub indeterminate: usize,
}

/// Root of `--format json` analysis output
#[derive(Debug, Clone, Serialize)]
pub struct JsonAnalysis {
    pub version: String,
    pub format: String,
    pub analyzed_at: DateTime<Utc>,
    pub summary: GraphStats,
    pub finding_counts: JsonFindingCounts,
    pub edges: Vec<DependencyEdge>,
    pub central_functions: Vec<CentralFunction>,
    pub cycles: Vec<Vec<FunctionId>>,
    pub findings: Vec<DriftFinding>,
    pub needs_review: Vec<FunctionId>,
    pub external_calls: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub correlations: Vec<Correlation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<FunctionInfo>,
}

impl JsonAnalysis {
    pub fn new(
        report: &AnalysisReport,
        correlations: &[Correlation],
        focus: Option<&FunctionInfo>,
    ) -> Self {
        let counts = report.count_by_confidence();
        let count = |c: Confidence| counts.get(&c).copied().unwrap_or(0);
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "fansy-analysis-v1".to_string(),
            analyzed_at: report.analyzed_at,
            summary: report.graph.stats(),
            finding_counts: JsonFindingCounts {
                definite: count(Confidence::Definite),
                heuristic: count(Confidence::Heuristic),
                indeterminate: count(Confidence::Indeterminate),
            },
            edges: report.graph.edges().cloned().collect(),
            central_functions: central_functions(report),
            cycles: report.cycles.clone(),
            findings: report.findings.clone(),
            needs_review: report.needs_review.clone(),
            external_calls: report.graph.external_calls().clone(),
            correlations: correlations.to_vec(),
            focus: focus.cloned(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Human-readable analysis summary
pub fn write_analysis<W: Write>(
    out: &mut W,
    report: &AnalysisReport,
    correlations: &[Correlation],
    focus: Option<&FunctionInfo>,
) -> io::Result<()> {
    let stats = report.graph.stats();
    let counts = report.count_by_confidence();

    writeln!(out, "Dependency graph")?;
    writeln!(out, "{}", "─".repeat(60))?;
    writeln!(out, "  functions:        {}", stats.functions)?;
    writeln!(out, "  edges:            {}", stats.edges)?;
    writeln!(out, "  call sites:       {}", stats.call_sites)?;
    writeln!(out, "  external calls:   {}", stats.external_calls)?;
    writeln!(out, "  unresolved sites: {}", stats.unresolved_sites)?;
    for (module, n) in &stats.functions_by_module {
        writeln!(out, "    {:<20} {:>6}", module, n)?;
    }

    if let Some(info) = focus {
        writeln!(out)?;
        writeln!(out, "Function {}", info.function)?;
        writeln!(out, "{}", "─".repeat(60))?;
        writeln!(out, "  called by ({}):", info.in_degree)?;
        for caller in &info.callers {
            writeln!(out, "    {}", caller)?;
        }
        writeln!(out, "  calls ({}):", info.out_degree)?;
        for callee in &info.callees {
            writeln!(out, "    {}", callee)?;
        }
        if !info.call_chains.is_empty() {
            writeln!(out, "  call chains ({}):", info.call_chains.len())?;
            for chain in &info.call_chains {
                let names: Vec<String> = chain.iter().map(ToString::to_string).collect();
                writeln!(out, "    {}", names.join(" → "))?;
            }
        }
    }

    let central = central_functions(report);
    if !central.is_empty() {
        writeln!(out)?;
        writeln!(out, "Central functions (betweenness)")?;
        writeln!(out, "{}", "─".repeat(60))?;
        for c in &central {
            writeln!(out, "  {:<44} {:>8.4}", c.function.to_string(), c.score)?;
        }
    }

    writeln!(out)?;
    if report.cycles.is_empty() {
        writeln!(out, "No call cycles.")?;
    } else {
        writeln!(out, "Call cycles ({})", report.cycles.len())?;
        writeln!(out, "{}", "─".repeat(60))?;
        for cycle in &report.cycles {
            let names: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            writeln!(out, "  {} → {}", names.join(" → "), names[0])?;
        }
    }

    writeln!(out)?;
    if report.findings.is_empty() {
        writeln!(out, "No signature drift found.")?;
    } else {
        writeln!(
            out,
            "Signature drift: {} definite, {} heuristic, {} indeterminate",
            counts.get(&Confidence::Definite).copied().unwrap_or(0),
            counts.get(&Confidence::Heuristic).copied().unwrap_or(0),
            counts.get(&Confidence::Indeterminate).copied().unwrap_or(0),
        )?;
        writeln!(
            out,
            "{:<14} {:<30} {:<30} {:>5} {:>5} {:>5}",
            "confidence", "callee", "caller", "line", "found", "req"
        )?;
        writeln!(out, "{}", "─".repeat(94))?;
        for f in &report.findings {
            writeln!(
                out,
                "{:<14} {:<30} {:<30} {:>5} {:>5} {:>5}",
                f.confidence.to_string(),
                f.callee.to_string(),
                f.caller.to_string(),
                f.line,
                f.found.map_or("?".to_string(), |n| n.to_string()),
                f.required.map_or("-".to_string(), |n| n.to_string()),
            )?;
        }
    }

    if !report.needs_review.is_empty() {
        writeln!(out)?;
        writeln!(out, "Needs manual review (unbalanced call sites):")?;
        for function in &report.needs_review {
            writeln!(out, "  {}", function)?;
        }
    }

    if !correlations.is_empty() {
        writeln!(out)?;
        writeln!(out, "Error log correlation")?;
        writeln!(out, "{}", "─".repeat(60))?;
        for c in correlations {
            writeln!(out, "  log line {}: {}", c.entry.log_line, c.entry.message)?;
            for f in &c.findings {
                writeln!(out, "    ↳ [{}] {}", f.confidence, f.message)?;
            }
        }
    }

    Ok(())
}

/// Per-function row of `JsonStats`
#[derive(Debug, Clone, Serialize)]
pub struct JsonFunctionStats {
    pub function: FunctionId,
    pub total_calls: u64,
    pub success_calls: u64,
    pub error_calls: u64,
    pub abandoned_calls: u64,
    pub mean_ns: f64,
    pub stddev_ns: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ns: Option<u64>,
}

/// Live statistics as served to the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct JsonStats {
    pub version: String,
    pub format: String,
    pub functions: Vec<JsonFunctionStats>,
    pub totals: StatTotals,
    pub store: StoreStats,
}

impl JsonStats {
    pub fn new(snapshot: &StatsSnapshot, store: StoreStats) -> Self {
        let functions = snapshot
            .entries()
            .into_iter()
            .map(|(id, s)| JsonFunctionStats {
                function: id.clone(),
                total_calls: s.total_calls,
                success_calls: s.success_calls,
                error_calls: s.error_calls,
                abandoned_calls: s.abandoned_calls,
                mean_ns: s.latency.mean,
                stddev_ns: s.latency.stddev(),
                min_ns: s.latency.min,
                max_ns: s.latency.max,
            })
            .collect();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "fansy-stats-v1".to_string(),
            functions,
            totals: snapshot.totals(),
            store,
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Per-function call table, busiest first
pub fn write_stats<W: Write>(
    out: &mut W,
    snapshot: &StatsSnapshot,
    store: &StoreStats,
) -> io::Result<()> {
    if snapshot.functions.is_empty() {
        writeln!(out, "No calls recorded.")?;
        return Ok(());
    }

    let totals = snapshot.totals();
    let mut sorted = snapshot.entries();
    sorted.sort_by(|a, b| b.1.total_calls.cmp(&a.1.total_calls).then_with(|| a.0.cmp(b.0)));

    writeln!(
        out,
        "% time     seconds   usecs/call     calls    errors abandoned function"
    )?;
    writeln!(
        out,
        "------ ----------- ------------ --------- --------- --------- ----------------"
    )?;
    for (id, s) in sorted {
        let percent = if totals.total_time_ns > 0 {
            s.latency.total as f64 / totals.total_time_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            out,
            "{:6.2} {:>11.6} {:>12.1} {:>9} {:>9} {:>9} {}",
            percent,
            s.latency.total as f64 / 1e9,
            s.latency.mean / 1e3,
            s.total_calls,
            blank_if_zero(s.error_calls),
            blank_if_zero(s.abandoned_calls),
            id
        )?;
    }
    writeln!(
        out,
        "------ ----------- ------------ --------- --------- --------- ----------------"
    )?;
    writeln!(
        out,
        "100.00 {:>11.6} {:>12} {:>9} {:>9} {:>9} total",
        totals.total_time_ns as f64 / 1e9,
        "",
        totals.total_calls,
        totals.total_errors,
        totals.total_abandoned
    )?;

    if store.dropped > 0 || store.evicted > 0 || store.late_ends > 0 {
        writeln!(
            out,
            "store: {} retained, {} in flight, {} dropped, {} evicted, {} late ends",
            store.retained, store.in_flight, store.dropped, store.evicted, store.late_ends
        )?;
    }
    Ok(())
}

fn blank_if_zero(n: u64) -> String {
    if n > 0 {
        n.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::call_record::{CallEvent, CallId, CallOutcome};
    use crate::call_store::CallStore;
    use crate::config::AnalysisConfig;
    use crate::function_def::{FunctionDefinition, Parameter};
    use chrono::TimeZone;

    fn sample_report() -> AnalysisReport {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let defs = vec![
            FunctionDefinition::new(
                FunctionId::new("M", "Rate"),
                vec![Parameter::required("d"), Parameter::required("c")],
                "",
                at,
            ),
            FunctionDefinition::new(FunctionId::new("M", "Doc"), vec![], "Rate(d); Doc();", at),
        ];
        analyze(&defs, &AnalysisConfig::default(), at)
    }

    #[test]
    fn test_text_report_sections() {
        let report = sample_report();
        let mut buf = Vec::new();
        let focus = report.graph.function_info(&FunctionId::new("M", "Rate"));
        write_analysis(&mut buf, &report, &[], focus.as_ref()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("functions:        2"));
        assert!(text.contains("Call cycles (1)"));
        assert!(text.contains("M->Doc → M->Doc"));
        assert!(text.contains("Signature drift: 1 definite"));
        assert!(text.contains("Function M->Rate"));
        assert!(!text.contains("Central functions"));
    }

    #[test]
    fn test_central_functions_and_chains_rendered() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let defs = vec![
            FunctionDefinition::new(FunctionId::new("M", "Top"), vec![], "Mid();", at),
            FunctionDefinition::new(FunctionId::new("M", "Mid"), vec![], "Leaf();", at),
            FunctionDefinition::new(FunctionId::new("M", "Leaf"), vec![], "", at),
        ];
        let report = analyze(&defs, &AnalysisConfig::default(), at);
        let focus = report.graph.function_info(&FunctionId::new("M", "Top"));

        let mut buf = Vec::new();
        write_analysis(&mut buf, &report, &[], focus.as_ref()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("call chains (1):"));
        assert!(text.contains("M->Top → M->Mid → M->Leaf"));
        assert!(text.contains("Central functions (betweenness)"));

        let json = JsonAnalysis::new(&report, &[], focus.as_ref()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["central_functions"].as_array().unwrap().len(), 1);
        assert_eq!(value["central_functions"][0]["function"]["name"], "Mid");
        assert_eq!(value["central_functions"][0]["score"], 0.5);
        assert_eq!(value["focus"]["call_chains"][0].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_json_report_field_names() {
        let report = sample_report();
        let json = JsonAnalysis::new(&report, &[], None).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["format"], "fansy-analysis-v1");
        assert_eq!(value["finding_counts"]["definite"], 1);
        assert_eq!(value["findings"][0]["confidence"], "definite");
        assert_eq!(value["findings"][0]["callee"]["name"], "Rate");
        assert_eq!(value["edges"].as_array().unwrap().len(), 2);
        assert!(value.get("focus").is_none());
        assert!(value.get("correlations").is_none());
    }

    #[test]
    fn test_stats_rendering() {
        let store = CallStore::with_limits(16, 16);
        let f = FunctionId::new("M", "F");
        store.record(CallEvent::Start {
            call_id: CallId(1),
            function: f.clone(),
            parent: None,
            context: "doc".to_string(),
            at: 0,
            params: vec![],
        });
        store.record(CallEvent::End {
            call_id: CallId(1),
            at: 2_000,
            outcome: CallOutcome::failure("boom"),
        });

        let mut buf = Vec::new();
        write_stats(&mut buf, &store.snapshot_stats(), &store.store_stats()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("M->F"));
        assert!(text.contains("total"));

        let json = JsonStats::new(&store.snapshot_stats(), store.store_stats())
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["functions"][0]["error_calls"], 1);
        assert_eq!(value["totals"]["total_calls"], 1);
        assert_eq!(value["store"]["retained"], 1);
    }

    #[test]
    fn test_empty_stats() {
        let store = CallStore::with_limits(4, 4);
        let mut buf = Vec::new();
        write_stats(&mut buf, &store.snapshot_stats(), &store.store_stats()).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No calls recorded.\n");
    }
}
