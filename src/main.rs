use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use fansy_tracer::analyzer;
use fansy_tracer::cli::{Cli, OutputFormat};
use fansy_tracer::config::TracerConfig;
use fansy_tracer::dependency_graph::DependencyGraph;
use fansy_tracer::error_log;
use fansy_tracer::function_def::{FunctionDefinition, FunctionId, StoredFunctionRow};
use fansy_tracer::report::{self, JsonAnalysis};
use serde::Deserialize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// One element of the input array
#[derive(Deserialize)]
#[serde(untagged)]
enum InputEntry {
    Definition(FunctionDefinition),
    Row(StoredFunctionRow),
}

fn load_definitions(path: &Path) -> Result<Vec<FunctionDefinition>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read definitions: {}", path.display()))?;
    let entries: Vec<InputEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid definitions JSON: {}", path.display()))?;

    let mut definitions = Vec::with_capacity(entries.len());
    let mut rows = Vec::new();
    for entry in entries {
        match entry {
            InputEntry::Definition(def) => definitions.push(def),
            InputEntry::Row(row) => rows.push(row),
        }
    }

    let (parsed, errors) = analyzer::definitions_from_rows(&rows);
    if !errors.is_empty() {
        eprintln!(
            "warning: skipped {} function row(s) with a malformed head",
            errors.len()
        );
    }
    definitions.extend(parsed);
    Ok(definitions)
}

/// Resolve `NAME` or `MODULE->NAME` against the graph
fn resolve_focus(graph: &DependencyGraph, text: &str) -> Result<FunctionId> {
    if let Some((module, name)) = text.split_once("->") {
        let id = FunctionId::new(module.trim(), name.trim());
        if graph.contains(&id) {
            return Ok(id);
        }
        anyhow::bail!("Unknown function: {}", text);
    }

    let matches: Vec<&FunctionId> = graph.nodes().filter(|id| id.name == text).collect();
    match matches.as_slice() {
        [only] => Ok((*only).clone()),
        [] => anyhow::bail!("Unknown function: {}", text),
        many => anyhow::bail!(
            "Ambiguous function {}: defined in {} modules, use MODULE->NAME",
            text,
            many.len()
        ),
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let mut config = match &args.config {
        Some(path) => TracerConfig::from_toml(path)?,
        None => TracerConfig::default(),
    };
    if let Some(max_cycle_len) = args.max_cycle_len {
        config.analysis.max_cycle_len = max_cycle_len;
        config
            .validate()
            .context("Invalid value for --max-cycle-len")?;
    }

    let now = args.at.unwrap_or_else(Utc::now);
    let definitions = load_definitions(&args.definitions)?;
    let report = analyzer::analyze(&definitions, &config.analysis, now);

    let focus = match args.focus.as_deref() {
        Some(text) => {
            let id = resolve_focus(&report.graph, text)?;
            report.graph.function_info(&id)
        }
        None => None,
    };

    let correlations = match &args.error_log {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("Failed to read error log: {}", path.display()))?;
            let entries = error_log::parse_log(&String::from_utf8_lossy(&raw));
            error_log::correlate(&entries, &report.findings)
        }
        None => Vec::new(),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match args.format {
        OutputFormat::Text => {
            report::write_analysis(&mut out, &report, &correlations, focus.as_ref())?;
        }
        OutputFormat::Json => {
            let json = JsonAnalysis::new(&report, &correlations, focus.as_ref()).to_json()?;
            writeln!(out, "{}", json)?;
        }
    }

    Ok(())
}
