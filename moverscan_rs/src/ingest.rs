use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::FixedOffset;
use polars::prelude::*;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::schema::{
    COL_CLOSE, COL_EXCHANGE, COL_HIGH, COL_INSTRUMENT, COL_LOW, COL_OPEN, COL_TIMESTAMP,
    COL_VOLUME, ColumnMapping, RawBar, parse_label, parse_number, parse_timestamp,
};
use crate::source::SourceFile;

/// Result of ingesting one source file.
#[derive(Debug)]
pub enum FileOutcome {
    Loaded {
        path: PathBuf,
        bars: Vec<RawBar>,
        /// Rows discarded for a missing instrument, exchange, timestamp or
        /// OHLC value.
        dropped: usize,
    },
    Failed {
        path: PathBuf,
        reason: String,
    },
}

impl FileOutcome {
    pub fn path(&self) -> &Path {
        match self {
            FileOutcome::Loaded { path, .. } | FileOutcome::Failed { path, .. } => path,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of one ingestion pass, surfaced to callers for reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files_scanned: usize,
    pub files_loaded: usize,
    pub failures: Vec<FileFailure>,
    pub rows_kept: usize,
    pub rows_dropped: usize,
    pub elapsed_ms: u64,
}

/// Bounded worker pool that turns source files into validated bar rows.
///
/// Each file is processed independently; a failure (unreadable file,
/// malformed CSV, missing columns, or a panic inside the reader) is caught at
/// the per-file boundary and recorded without affecting sibling files.
#[derive(Debug, Clone)]
pub struct IngestionPool {
    workers: usize,
    tz: FixedOffset,
}

impl IngestionPool {
    pub fn new(workers: usize, tz: FixedOffset) -> Self {
        Self {
            workers: workers.max(1),
            tz,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Ingest every file, returning one outcome per input in input order.
    pub fn run(&self, files: &[SourceFile]) -> Result<Vec<FileOutcome>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|idx| format!("moverscan-ingest-{idx}"))
            .build()
            .context("Failed to build ingestion worker pool")?;

        let tz = self.tz;
        let outcomes = pool.install(|| {
            files
                .par_iter()
                .map(|file| ingest_isolated(file, &tz))
                .collect::<Vec<_>>()
        });
        Ok(outcomes)
    }

    /// Run the pool and split the outcomes into per-file bar sequences plus a
    /// report. Failed files contribute nothing to the returned sequences.
    pub fn ingest(&self, files: &[SourceFile]) -> Result<(Vec<Vec<RawBar>>, IngestReport)> {
        let start = Instant::now();
        let outcomes = self.run(files)?;

        let mut report = IngestReport {
            files_scanned: files.len(),
            ..IngestReport::default()
        };
        let mut sequences = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                FileOutcome::Loaded {
                    path,
                    bars,
                    dropped,
                } => {
                    if dropped > 0 {
                        warn!(
                            file = %path.display(),
                            dropped,
                            kept = bars.len(),
                            "Dropped rows with missing required fields"
                        );
                    }
                    report.files_loaded += 1;
                    report.rows_kept += bars.len();
                    report.rows_dropped += dropped;
                    sequences.push(bars);
                }
                FileOutcome::Failed { path, reason } => {
                    warn!(file = %path.display(), reason = %reason, "Skipping unreadable source file");
                    report.failures.push(FileFailure { path, reason });
                }
            }
        }
        report.elapsed_ms = (start.elapsed().as_secs_f32() * 1000.0).round() as u64;

        info!(
            files = report.files_scanned,
            loaded = report.files_loaded,
            failed = report.failures.len(),
            rows = report.rows_kept,
            dropped = report.rows_dropped,
            workers = self.workers,
            elapsed_ms = report.elapsed_ms,
            "Ingestion finished"
        );
        Ok((sequences, report))
    }
}

fn ingest_isolated(file: &SourceFile, tz: &FixedOffset) -> FileOutcome {
    let path = file.path.clone();
    if file.is_missing() {
        return FileOutcome::Failed {
            path,
            reason: "file vanished before it could be read".to_string(),
        };
    }
    match catch_unwind(AssertUnwindSafe(|| read_source_file(&file.path, tz))) {
        Ok(Ok((bars, dropped))) => FileOutcome::Loaded {
            path,
            bars,
            dropped,
        },
        Ok(Err(err)) => FileOutcome::Failed {
            path,
            reason: format!("{err:#}"),
        },
        Err(_) => FileOutcome::Failed {
            path,
            reason: "reader panicked while parsing the file".to_string(),
        },
    }
}

fn read_source_frame(path: &Path) -> Result<DataFrame> {
    // Every column is read as text; coercion happens per cell so a single
    // bad value only invalidates its own row.
    let lazy = LazyCsvReader::new(path)
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .finish()
        .with_context(|| format!("Failed to initialize CSV reader for {}", path.display()))?;
    lazy.collect()
        .with_context(|| format!("Failed to parse CSV data from {}", path.display()))
}

fn text_column(frame: &DataFrame, position: usize) -> Result<Series> {
    let series = frame
        .get_columns()
        .get(position)
        .with_context(|| format!("Column index {position} out of range"))?;
    series
        .cast(&DataType::String)
        .with_context(|| format!("Failed to read column '{}' as text", series.name()))
}

/// Read one file into validated rows sorted by timestamp, returning the rows
/// and the number of rows dropped for missing required fields.
pub fn read_source_file(path: &Path, tz: &FixedOffset) -> Result<(Vec<RawBar>, usize)> {
    let frame = read_source_frame(path)?;
    let headers: Vec<String> = frame
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let mapping = ColumnMapping::resolve(&headers);
    let missing = mapping.missing_required();
    if !missing.is_empty() {
        return Err(anyhow!(
            "Schema mismatch in {}: missing column(s) {} (found: {})",
            path.display(),
            missing.join(", "),
            headers.join(", ")
        ));
    }

    let required = |name: &str| -> Result<Series> {
        let position = mapping
            .position(name)
            .with_context(|| format!("Missing required column {name}"))?;
        text_column(&frame, position)
    };
    let instrument = required(COL_INSTRUMENT)?;
    let exchange = required(COL_EXCHANGE)?;
    let timestamp = required(COL_TIMESTAMP)?;
    let open = required(COL_OPEN)?;
    let high = required(COL_HIGH)?;
    let low = required(COL_LOW)?;
    let close = required(COL_CLOSE)?;
    let volume = match mapping.position(COL_VOLUME) {
        Some(position) => Some(text_column(&frame, position)?),
        None => None,
    };

    let instrument = instrument.str()?;
    let exchange = exchange.str()?;
    let timestamp = timestamp.str()?;
    let open = open.str()?;
    let high = high.str()?;
    let low = low.str()?;
    let close = close.str()?;
    let volume = match &volume {
        Some(series) => Some(series.str()?),
        None => None,
    };

    let height = frame.height();
    let mut bars = Vec::with_capacity(height);
    let mut dropped = 0usize;
    for idx in 0..height {
        let row = (|| {
            Some(RawBar {
                instrument: parse_label(instrument.get(idx))?,
                exchange: parse_label(exchange.get(idx))?,
                timestamp_ms: parse_timestamp(timestamp.get(idx), tz)?.timestamp_millis(),
                open: parse_number(open.get(idx))?,
                high: parse_number(high.get(idx))?,
                low: parse_number(low.get(idx))?,
                close: parse_number(close.get(idx))?,
                volume: volume.and_then(|ca| parse_number(ca.get(idx))),
            })
        })();
        match row {
            Some(bar) => bars.push(bar),
            None => dropped += 1,
        }
    }

    bars.sort_by_key(|bar| bar.timestamp_ms);
    Ok((bars, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    #[test]
    fn read_source_file_drops_incomplete_rows_and_sorts() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("infy.csv");
        fs::write(
            &path,
            "Symbol,Exchange,Date,Open,High,Low,Close,Volume\n\
             INFY,NSE,2024-03-01 09:17:00,101,102,100.5,101.5,10\n\
             INFY,NSE,2024-03-01 09:15:00,100,101,99.5,100.5,\n\
             INFY,,2024-03-01 09:16:00,100,101,99.5,100.5,7\n\
             INFY,NSE,2024-03-01 09:18:00,abc,101,99.5,100.5,7\n\
             INFY,NSE,not-a-time,100,101,99.5,100.5,7\n",
        )?;

        let (bars, dropped) = read_source_file(&path, &ist())?;
        assert_eq!(dropped, 3);
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp_ms < bars[1].timestamp_ms);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].volume, None);
        assert_eq!(bars[1].volume, Some(10.0));
        assert_eq!(bars[1].instrument, "INFY");
        Ok(())
    }

    #[test]
    fn read_source_file_reports_schema_mismatch() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.csv");
        fs::write(&path, "foo,bar\n1,2\n")?;
        let err = read_source_file(&path, &ist()).expect_err("missing columns must fail");
        let msg = format!("{err:#}");
        assert!(msg.contains("Schema mismatch"), "unexpected error: {msg}");
        assert!(msg.contains("instrument"));
        Ok(())
    }

    #[test]
    fn volume_column_is_optional() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("novol.csv");
        fs::write(
            &path,
            "instrument,exchange,timestamp,open,high,low,close\n\
             TCS,NSE,2024-03-01T09:15:00+05:30,10,11,9,10.5\n",
        )?;
        let (bars, dropped) = read_source_file(&path, &ist())?;
        assert_eq!(dropped, 0);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, None);
        Ok(())
    }

    #[test]
    fn pool_isolates_failures_and_preserves_input_order() -> Result<()> {
        let dir = tempdir()?;
        let good = dir.path().join("a.csv");
        let bad = dir.path().join("b.csv");
        fs::write(
            &good,
            "instrument,exchange,timestamp,open,high,low,close,volume\n\
             A,NSE,2024-03-01 09:15:00,1,2,0.5,1.5,100\n",
        )?;
        fs::write(&bad, "\u{0}\u{1}garbage without columns\n")?;
        let files = vec![
            SourceFile::stat(good.clone()),
            SourceFile::stat(bad.clone()),
            SourceFile::vanished(dir.path().join("gone.csv")),
        ];

        let pool = IngestionPool::new(2, ist());
        let outcomes = pool.run(&files)?;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].path(), good.as_path());
        assert!(!outcomes[0].is_failed());
        assert!(outcomes[1].is_failed());
        assert!(outcomes[2].is_failed());

        let (sequences, report) = pool.ingest(&files)?;
        assert_eq!(sequences.len(), 1);
        assert_eq!(report.files_scanned, 3);
        assert_eq!(report.files_loaded, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.rows_kept, 1);
        Ok(())
    }
}
