use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};

use moverscan_rs::schema::parse_timestamp;
use moverscan_rs::{ChartMode, Config, ScanMode, Window};

#[derive(Parser, Debug)]
#[command(
    name = "moverscan",
    about = "Cached minute-bar master dataset and window mover scanner"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the master dataset (cache hit or rebuild) and print its manifest
    #[command(name = "build")]
    Build(BuildArgs),
    /// Rank eligible gainers and losers inside a time window
    #[command(name = "scan")]
    Scan(ScanArgs),
    /// Print one instrument's session bars for a calendar day as CSV
    #[command(name = "bars")]
    Bars(BarsArgs),
}

impl Commands {
    pub fn source(&self) -> &SourceArgs {
        match self {
            Commands::Build(args) => &args.source,
            Commands::Scan(args) => &args.source,
            Commands::Bars(args) => &args.source,
        }
    }
}

/// Flags shared by every subcommand: where the data lives and how it is
/// ingested.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Directory of per-instrument minute-bar CSV files
    #[arg(long = "dir", value_hint = clap::ValueHint::DirPath)]
    pub dir: PathBuf,

    /// Optional JSON config file; explicit flags override its values
    #[arg(long = "config", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Cache directory (defaults to <dir>/.moverscan_cache)
    #[arg(long = "cache-dir", value_hint = clap::ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,

    /// Input file extensions, comma separated
    #[arg(long = "ext", value_delimiter = ',')]
    pub extensions: Vec<String>,

    /// Ingestion worker threads (omit to use all logical cores)
    #[arg(long = "workers", alias = "n-jobs")]
    pub workers: Option<usize>,

    /// Fixed exchange offset east of UTC, in minutes
    #[arg(long = "tz-offset-minutes", allow_hyphen_values = true)]
    pub tz_offset_minutes: Option<i32>,

    /// Absolute tolerance for the first-bar wick check
    #[arg(long = "abs-tol")]
    pub abs_tol: Option<f64>,

    /// Relative tolerance for the first-bar wick check
    #[arg(long = "rel-tol")]
    pub rel_tol: Option<f64>,

    /// Rebuild the master dataset even when a valid cache exists
    #[arg(long = "force", alias = "force-rebuild", default_value_t = false)]
    pub force: bool,

    /// Also append logs to this file
    #[arg(long = "log-file", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Print the manifest as JSON
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Window start, e.g. "2024-03-01 09:15" (naive values use the exchange offset)
    #[arg(long = "from")]
    pub from: String,

    /// Window end, inclusive
    #[arg(long = "to")]
    pub to: String,

    /// Which eligible movers to keep
    #[arg(long = "mode", value_enum, default_value = "both")]
    pub mode: ScanModeValue,

    /// Chart candidate ordering (defaults to the mode's natural ordering)
    #[arg(long = "chart-mode", value_enum)]
    pub chart_mode: Option<ChartModeValue>,

    /// Maximum chart candidates
    #[arg(long = "top-k")]
    pub top_k: Option<usize>,

    /// Print the full result as JSON
    #[arg(long = "json", default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct BarsArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Instrument symbol
    #[arg(long = "instrument")]
    pub instrument: String,

    /// Session date (YYYY-MM-DD)
    #[arg(long = "date")]
    pub date: String,
}

impl Cli {
    pub fn parse() -> Self {
        <Cli as Parser>::parse()
    }
}

impl SourceArgs {
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let mut loaded = Config::load_json(path)?;
                loaded.source_dir = self.dir.clone();
                loaded
            }
            None => Config::new(self.dir.clone()),
        };
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        if !self.extensions.is_empty() {
            config.extensions = self
                .extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_string())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if self.workers.is_some() {
            config.max_workers = normalize_workers(self.workers);
        }
        if let Some(minutes) = self.tz_offset_minutes {
            config.timezone_offset_minutes = minutes;
        }
        if let Some(abs) = self.abs_tol {
            config.tolerance.abs = abs;
        }
        if let Some(rel) = self.rel_tol {
            config.tolerance.rel = rel;
        }
        config.force_rebuild |= self.force;
        config.validate()?;
        Ok(config)
    }
}

impl ScanArgs {
    /// Build the config and the validated query window.
    pub fn into_query(self) -> Result<(Config, Window, ScanMode, bool)> {
        let mut config = self.source.into_config()?;
        if let Some(chart_mode) = self.chart_mode {
            config.chart_mode = Some(chart_mode.to_mode());
        }
        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        let tz = config.timezone()?;
        let from = parse_instant(&self.from, &tz)?;
        let to = parse_instant(&self.to, &tz)?;
        let window = Window::new(from, to)?;
        Ok((config, window, self.mode.to_mode(), self.json))
    }
}

impl BarsArgs {
    pub fn into_request(self) -> Result<(Config, String, NaiveDate)> {
        let date = parse_date(&self.date)?;
        let instrument = self.instrument.trim().to_string();
        if instrument.is_empty() {
            return Err(anyhow!("--instrument must not be empty"));
        }
        Ok((self.source.into_config()?, instrument, date))
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ScanModeValue {
    Gainers,
    Losers,
    Both,
}

impl ScanModeValue {
    pub fn to_mode(self) -> ScanMode {
        match self {
            ScanModeValue::Gainers => ScanMode::Gainers,
            ScanModeValue::Losers => ScanMode::Losers,
            ScanModeValue::Both => ScanMode::Both,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ChartModeValue {
    Gainers,
    Losers,
    /// Largest absolute move first
    Abs,
}

impl ChartModeValue {
    fn to_mode(self) -> ChartMode {
        match self {
            ChartModeValue::Gainers => ChartMode::Gainers,
            ChartModeValue::Losers => ChartMode::Losers,
            ChartModeValue::Abs => ChartMode::Abs,
        }
    }
}

fn normalize_workers(value: Option<usize>) -> usize {
    value.filter(|n| *n > 0).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

fn parse_instant(raw: &str, tz: &FixedOffset) -> Result<DateTime<FixedOffset>> {
    parse_timestamp(Some(raw), tz).with_context(|| {
        format!("Invalid instant {raw:?}. Expected e.g. 2024-03-01 09:15 or RFC 3339")
    })
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid date format for {raw}. Expected YYYY-MM-DD"))
}
