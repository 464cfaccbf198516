use std::fs;

use anyhow::Result;
use moverscan_rs::{CacheOutcome, Config, MasterStore};
use tempfile::tempdir;

const HEADER: &str = "instrument,exchange,timestamp,open,high,low,close,volume\n";

#[test]
fn one_corrupt_file_is_reported_and_excluded() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join("a.csv"),
        format!("{HEADER}AAA,NSE,2024-03-01 09:15:00,10,11,10,10.5,100\n"),
    )?;
    fs::write(
        dir.path().join("b.csv"),
        format!(
            "{HEADER}\
             BBB,NSE,2024-03-01 09:15:00,20,21,20,20.5,100\n\
             BBB,NSE,not-a-time,20,21,20,20.5,100\n"
        ),
    )?;
    fs::write(
        dir.path().join("c.csv"),
        "ticker,when,price\nCCC,yesterday,1\n",
    )?;

    let resolved = MasterStore::new(Config::new(dir.path()))?.resolve()?;
    assert!(matches!(resolved.outcome, CacheOutcome::Rebuilt { .. }));

    let report = resolved.ingest.expect("rebuild carries an ingest report");
    assert_eq!(report.files_scanned, 3);
    assert_eq!(report.files_loaded, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].path.ends_with("c.csv"));
    assert!(
        report.failures[0].reason.contains("missing column"),
        "unexpected reason: {}",
        report.failures[0].reason
    );
    assert_eq!(report.rows_kept, 2);
    assert_eq!(report.rows_dropped, 1);

    assert_eq!(resolved.dataset.len(), 2);
    assert_eq!(
        resolved.dataset.instruments(),
        &["AAA".to_string(), "BBB".to_string()]
    );
    Ok(())
}

#[test]
fn empty_source_directory_is_fatal() -> Result<()> {
    let dir = tempdir()?;
    fs::write(dir.path().join("notes.txt"), "not an input")?;
    let err = MasterStore::new(Config::new(dir.path()))?
        .resolve()
        .expect_err("no inputs must be fatal");
    assert!(format!("{err:#}").contains("No source files"));
    Ok(())
}
