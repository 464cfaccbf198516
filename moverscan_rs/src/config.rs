use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

/// Name of the cache subdirectory created beneath the source directory.
pub const CACHE_DIR_NAME: &str = ".moverscan_cache";

/// Which eligible movers a query keeps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Gainers,
    Losers,
    #[default]
    Both,
}

/// How the chart-candidate subset is chosen from the eligible set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChartMode {
    /// Top K by pct_change descending.
    Gainers,
    /// Top K by pct_change ascending (most negative first).
    Losers,
    /// Top K by |pct_change| descending.
    Abs,
}

impl ChartMode {
    /// Chart selection implied by a scan mode when none is configured.
    pub fn for_scan_mode(mode: ScanMode) -> Self {
        match mode {
            ScanMode::Gainers => ChartMode::Gainers,
            ScanMode::Losers => ChartMode::Losers,
            ScanMode::Both => ChartMode::Abs,
        }
    }
}

/// Approximate-equality parameters for the first-bar wick rule.
///
/// Two prices `a` and `b` are considered equal when
/// `|a - b| <= max(abs, rel * max(|a|, |b|))`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Tolerance {
    #[serde(default = "default_abs_tolerance")]
    pub abs: f64,
    #[serde(default = "default_rel_tolerance")]
    pub rel: f64,
}

pub const DEFAULT_ABS_TOLERANCE: f64 = 1e-4;
pub const DEFAULT_REL_TOLERANCE: f64 = 1e-6;

fn default_abs_tolerance() -> f64 {
    DEFAULT_ABS_TOLERANCE
}

fn default_rel_tolerance() -> f64 {
    DEFAULT_REL_TOLERANCE
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            abs: DEFAULT_ABS_TOLERANCE,
            rel: DEFAULT_REL_TOLERANCE,
        }
    }
}

impl Tolerance {
    pub fn close(&self, a: f64, b: f64) -> bool {
        if !a.is_finite() || !b.is_finite() {
            return false;
        }
        let scale = a.abs().max(b.abs());
        (a - b).abs() <= self.abs.max(self.rel * scale)
    }
}

/// Exchange-local offset used to normalise every timestamp (IST, +05:30).
pub const DEFAULT_TZ_OFFSET_MINUTES: i32 = 330;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_TOP_K: usize = 10;

fn default_tz_offset_minutes() -> i32 {
    DEFAULT_TZ_OFFSET_MINUTES
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_extensions() -> Vec<String> {
    vec!["csv".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one minute-bar history file per instrument (or batch).
    pub source_dir: PathBuf,
    /// Optional cache location. When omitted, `<source_dir>/.moverscan_cache`
    /// is used.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// File extensions (case-insensitive, without the dot) treated as inputs.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Fixed offset east of UTC, in minutes, that every bar timestamp is
    /// normalised to. Naive timestamps are interpreted in this offset.
    #[serde(default = "default_tz_offset_minutes")]
    pub timezone_offset_minutes: i32,
    /// Upper bound on ingestion workers. The effective pool size is
    /// `min(available_parallelism, max_workers)`.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub tolerance: Tolerance,
    /// Maximum number of chart candidates returned per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Chart selection override. When None, the selection follows the scan
    /// mode (gainers/losers/abs for gainers/losers/both).
    #[serde(default)]
    pub chart_mode: Option<ChartMode>,
    /// Ignore a valid cache and rebuild from source.
    #[serde(default)]
    pub force_rebuild: bool,
}

impl Config {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_dir: None,
            extensions: default_extensions(),
            timezone_offset_minutes: DEFAULT_TZ_OFFSET_MINUTES,
            max_workers: DEFAULT_MAX_WORKERS,
            tolerance: Tolerance::default(),
            top_k: DEFAULT_TOP_K,
            chart_mode: None,
            force_rebuild: false,
        }
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config JSON in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timezone()?;
        if self.extensions.is_empty() {
            return Err(anyhow!("At least one input file extension is required"));
        }
        if !(self.tolerance.abs >= 0.0 && self.tolerance.rel >= 0.0) {
            return Err(anyhow!(
                "Tolerances must be non-negative (abs={}, rel={})",
                self.tolerance.abs,
                self.tolerance.rel
            ));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.timezone_offset_minutes * 60).ok_or_else(|| {
            anyhow!(
                "Timezone offset of {} minutes is out of range",
                self.timezone_offset_minutes
            )
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.source_dir.join(CACHE_DIR_NAME))
    }

    /// Effective ingestion pool size.
    pub fn worker_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        available.min(self.max_workers.max(1))
    }

    pub fn effective_chart_mode(&self, mode: ScanMode) -> ChartMode {
        self.chart_mode
            .unwrap_or_else(|| ChartMode::for_scan_mode(mode))
    }
}
