mod cli;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use cli::{BarsArgs, BuildArgs, Cli, Commands, ScanArgs};
use moverscan_rs::{CacheOutcome, MasterStore, MoverRecord, MoverScanner, ResolvedDataset};
use serde::Serialize;
use tracing_appender::non_blocking;
use tracing_subscriber::{EnvFilter, prelude::*};

fn init_tracing(log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout stays clean for tables, JSON and CSV.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| anyhow!("failed to create log directory {parent:?}: {err}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| anyhow!("failed to open log file {path:?}: {err}"))?;
        let (non_blocking_writer, guard) = non_blocking(file);
        // Leaked so the writer outlives every span for the rest of the process.
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking_writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

#[derive(Serialize)]
struct BuildSummary<'a> {
    hash: &'a str,
    outcome: String,
    rows: usize,
    instruments: usize,
    source_files: usize,
    elapsed_ms: u64,
    pruned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingest: Option<&'a moverscan_rs::IngestReport>,
}

fn describe_outcome(outcome: &CacheOutcome) -> String {
    match outcome {
        CacheOutcome::Hit => "hit".to_string(),
        CacheOutcome::Rebuilt { reason } => format!("rebuilt ({reason})"),
    }
}

fn run_build(args: BuildArgs) -> Result<()> {
    let json = args.json;
    let store = MasterStore::new(args.source.into_config()?)?;
    let resolved = store.resolve()?;
    print_build(&resolved, json)
}

fn print_build(resolved: &ResolvedDataset, json: bool) -> Result<()> {
    let summary = BuildSummary {
        hash: &resolved.hash,
        outcome: describe_outcome(&resolved.outcome),
        rows: resolved.manifest.row_count,
        instruments: resolved.manifest.instrument_count,
        source_files: resolved.manifest.source_files,
        elapsed_ms: resolved.elapsed_ms,
        pruned: resolved.pruned.len(),
        ingest: resolved.ingest.as_ref(),
    };
    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &summary)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(out, "cache      : {}", summary.outcome)?;
    writeln!(out, "hash       : {}", summary.hash)?;
    writeln!(out, "rows       : {}", summary.rows)?;
    writeln!(out, "instruments: {}", summary.instruments)?;
    writeln!(out, "files      : {}", summary.source_files)?;
    if let Some(report) = summary.ingest {
        writeln!(
            out,
            "ingest     : {} loaded, {} failed, {} rows dropped",
            report.files_loaded,
            report.failures.len(),
            report.rows_dropped
        )?;
        for failure in &report.failures {
            writeln!(out, "  failed {}: {}", failure.path.display(), failure.reason)?;
        }
    }
    writeln!(out, "elapsed_ms : {}", summary.elapsed_ms)?;
    Ok(())
}

fn run_scan(args: ScanArgs) -> Result<()> {
    let (config, window, mode, json) = args.into_query()?;
    let (scanner, _) = MoverScanner::open(config)?;
    let result = scanner.query(&window, mode);

    let mut out = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &result)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(
        out,
        "window {} .. {}  mode={:?}  instruments={}  eligible={}",
        window.start().format("%Y-%m-%d %H:%M:%S%:z"),
        window.end().format("%Y-%m-%d %H:%M:%S%:z"),
        result.mode,
        result.instruments_in_window,
        result.leaderboard.len()
    )?;
    if result.is_empty() {
        writeln!(out, "no eligible movers in this window")?;
        return Ok(());
    }
    writeln!(out, "\nleaderboard")?;
    write_records(&mut out, &result.leaderboard)?;
    writeln!(out, "\nchart candidates ({:?})", result.chart_mode)?;
    write_records(&mut out, &result.chart_candidates)?;
    Ok(())
}

fn write_records(out: &mut impl Write, records: &[MoverRecord]) -> Result<()> {
    writeln!(
        out,
        "{:>4}  {:<20} {:>8} {:>12} {:>12} {:>9} {:>5}",
        "#", "instrument", "side", "open", "close", "pct", "bars"
    )?;
    for (idx, record) in records.iter().enumerate() {
        let agg = &record.aggregate;
        writeln!(
            out,
            "{:>4}  {:<20} {:>8} {:>12.4} {:>12.4} {:>8.3}% {:>5}",
            idx + 1,
            agg.instrument,
            format!("{:?}", record.eligibility).to_lowercase(),
            agg.open_in_window,
            agg.close_in_window,
            agg.pct_change,
            agg.bar_count
        )?;
    }
    Ok(())
}

fn run_bars(args: BarsArgs) -> Result<()> {
    let (config, instrument, date) = args.into_request()?;
    let (scanner, _) = MoverScanner::open(config)?;
    let bars = scanner.session_bars(&instrument, date);
    if bars.is_empty() {
        tracing::warn!(instrument = %instrument, %date, "No bars for this session");
    }
    let mut out = io::stdout().lock();
    writeln!(out, "instrument,exchange,timestamp,open,high,low,close,volume")?;
    for bar in bars {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            bar.instrument,
            bar.exchange,
            bar.timestamp.to_rfc3339(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume.map(|v| v.to_string()).unwrap_or_default()
        )?;
    }
    out.flush().context("Failed to write bars to stdout")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.source().log_file.clone())?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %cli.command.source().dir.display(),
        "moverscan invoked"
    );

    match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Scan(args) => run_scan(args),
        Commands::Bars(args) => run_bars(args),
    }
}
