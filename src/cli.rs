//! CLI argument parsing for fansy-tracer

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for analysis reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for the dashboard
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "fansy-tracer")]
#[command(version)]
#[command(
    about = "Call dependency and signature drift analysis for FANSY-SCRIPT functions",
    long_about = None
)]
pub struct Cli {
    /// JSON array of function revisions (parsed definitions or raw head/body rows)
    #[arg(value_name = "DEFINITIONS")]
    pub definitions: PathBuf,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Interpreter error log to correlate with findings
    #[arg(long = "error-log", value_name = "FILE")]
    pub error_log: Option<PathBuf>,

    /// Show callers and callees of one function (NAME or MODULE->NAME)
    #[arg(long = "focus", value_name = "FUNCTION")]
    pub focus: Option<String>,

    /// Longest call cycle to report (overrides the config file)
    #[arg(long = "max-cycle-len", value_name = "N")]
    pub max_cycle_len: Option<usize>,

    /// Evaluate signatures as of this instant (RFC 3339, default: now)
    #[arg(long = "at", value_name = "TIMESTAMP")]
    pub at: Option<DateTime<Utc>>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
