//! Tracer configuration loaded from TOML
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration.
//!
//! ```toml
//! [store]
//! max_records = 10000
//! max_in_flight = 4096
//!
//! [reaper]
//! interval_ms = 1000
//! staleness_ms = 300000
//!
//! [analysis]
//! max_cycle_len = 8
//! max_cycles = 1000
//! slow_call_ms = 1000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub store: StoreConfig,
    pub reaper: ReaperConfig,
    pub analysis: AnalysisConfig,
}

/// Call store bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Completed call records retained before the oldest is evicted
    pub max_records: usize,
    /// Concurrent in-flight calls before start events are dropped
    pub max_in_flight: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_in_flight: 4_096,
        }
    }
}

/// Stale-call sweep settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    /// In flight at least this long means abandoned
    pub staleness_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            staleness_ms: 300_000, // 5 minutes: longest observed document run
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Staleness threshold in clock units (nanoseconds)
    pub fn staleness_ns(&self) -> u64 {
        self.staleness_ms.saturating_mul(1_000_000)
    }
}

/// Static analysis settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Elementary cycles longer than this are not enumerated
    pub max_cycle_len: usize,
    /// Stop enumerating after this many cycles
    pub max_cycles: usize,
    pub slow_call_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_cycle_len: 8,
            max_cycles: 1_000,
            slow_call_ms: 1_000,
        }
    }
}

impl AnalysisConfig {
    /// Slow-call threshold in clock units (nanoseconds)
    pub fn slow_call_ns(&self) -> u64 {
        self.slow_call_ms.saturating_mul(1_000_000)
    }
}

impl TracerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if the file can't be read, has invalid TOML syntax, or
    /// fails [`TracerConfig::validate`].
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TracerConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.max_records == 0 {
            anyhow::bail!("store.max_records must be > 0");
        }
        if self.store.max_in_flight == 0 {
            anyhow::bail!("store.max_in_flight must be > 0");
        }
        if self.reaper.interval_ms == 0 {
            anyhow::bail!("reaper.interval_ms must be > 0");
        }
        if self.reaper.staleness_ms == 0 {
            anyhow::bail!("reaper.staleness_ms must be > 0");
        }
        if self.analysis.max_cycle_len == 0 {
            anyhow::bail!("analysis.max_cycle_len must be >= 1");
        }
        Ok(())
    }
}
