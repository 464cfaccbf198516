use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use moverscan_rs::{ChartMode, Config, Eligibility, MoverScanner, ScanMode, Window};
use tempfile::tempdir;

const HEADER: &str = "instrument,exchange,timestamp,open,high,low,close,volume\n";

fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(330 * 60)
        .unwrap()
        .with_ymd_and_hms(2024, 3, 1, h, m, 0)
        .single()
        .unwrap()
}

fn write_fixture(dir: &Path) -> Result<()> {
    fs::write(
        dir.join("a.csv"),
        format!(
            "{HEADER}\
             A,NSE,2024-03-01 09:14:00,90,101,89,100,10\n\
             A,NSE,2024-03-01 09:15:00,100,120,100,118,10\n\
             A,NSE,2024-03-01 09:20:00,118,151,117,150,10\n\
             A,NSE,2024-03-01 09:21:00,150,160,149,155,10\n"
        ),
    )?;
    fs::write(
        dir.join("b.csv"),
        format!(
            "{HEADER}\
             B,NSE,2024-03-01 09:15:00,200,200,170,175,10\n\
             B,NSE,2024-03-01 09:20:00,175,176,149,150,10\n"
        ),
    )?;
    // Rose, but the first bar dipped below its open.
    fs::write(
        dir.join("c.csv"),
        format!(
            "{HEADER}\
             C,NSE,2024-03-01 09:15:00,50,55,49,54,10\n\
             C,NSE,2024-03-01 09:20:00,54,61,53,60,10\n"
        ),
    )?;
    // Flat across the window.
    fs::write(
        dir.join("d.csv"),
        format!(
            "{HEADER}\
             D,NSE,2024-03-01 09:15:00,10,10,10,10,10\n\
             D,NSE,2024-03-01 09:20:00,10,10,10,10,10\n"
        ),
    )?;
    Ok(())
}

#[test]
fn gainer_then_loser_in_leaderboard_order() -> Result<()> {
    let dir = tempdir()?;
    write_fixture(dir.path())?;
    let (scanner, _) = MoverScanner::open(Config::new(dir.path()))?;

    let result = scanner.query(&Window::new(at(9, 15), at(9, 20))?, ScanMode::Both);
    assert_eq!(result.instruments_in_window, 4);

    let board = &result.leaderboard;
    assert_eq!(board.len(), 2);
    assert_eq!(board[0].instrument(), "A");
    assert_eq!(board[0].eligibility, Eligibility::Gainer);
    assert!((board[0].pct_change() - 50.0).abs() < 1e-6);
    assert_eq!(board[0].aggregate.bar_count, 2);
    assert_eq!(board[1].instrument(), "B");
    assert_eq!(board[1].eligibility, Eligibility::Loser);
    assert!((board[1].pct_change() + 25.0).abs() < 1e-6);

    assert_eq!(result.chart_mode, ChartMode::Abs);
    let chart: Vec<&str> = result
        .chart_candidates
        .iter()
        .map(|r| r.instrument())
        .collect();
    assert_eq!(chart, vec!["A", "B"]);
    Ok(())
}

#[test]
fn single_sided_modes_filter_the_leaderboard() -> Result<()> {
    let dir = tempdir()?;
    write_fixture(dir.path())?;
    let (scanner, _) = MoverScanner::open(Config::new(dir.path()))?;
    let window = Window::new(at(9, 15), at(9, 20))?;

    let gainers = scanner.query(&window, ScanMode::Gainers);
    assert_eq!(gainers.leaderboard.len(), 1);
    assert_eq!(gainers.leaderboard[0].instrument(), "A");
    assert_eq!(gainers.chart_mode, ChartMode::Gainers);

    let losers = scanner.query(&window, ScanMode::Losers);
    assert_eq!(losers.leaderboard.len(), 1);
    assert_eq!(losers.leaderboard[0].instrument(), "B");
    assert_eq!(losers.chart_mode, ChartMode::Losers);
    Ok(())
}

#[test]
fn window_outside_data_is_empty_not_an_error() -> Result<()> {
    let dir = tempdir()?;
    write_fixture(dir.path())?;
    let (scanner, _) = MoverScanner::open(Config::new(dir.path()))?;

    let result = scanner.query(&Window::new(at(14, 0), at(15, 30))?, ScanMode::Both);
    assert!(result.is_empty());
    assert!(result.chart_candidates.is_empty());
    assert_eq!(result.instruments_in_window, 0);
    Ok(())
}

#[test]
fn cached_scanner_answers_identically() -> Result<()> {
    let dir = tempdir()?;
    write_fixture(dir.path())?;
    let window = Window::new(at(9, 15), at(9, 20))?;

    let (fresh, _) = MoverScanner::open(Config::new(dir.path()))?;
    let (cached, resolved) = MoverScanner::open(Config::new(dir.path()))?;
    assert_eq!(resolved.outcome, moverscan_rs::CacheOutcome::Hit);
    assert_eq!(
        fresh.query(&window, ScanMode::Both),
        cached.query(&window, ScanMode::Both)
    );
    Ok(())
}

#[test]
fn session_bars_cover_the_calendar_day() -> Result<()> {
    let dir = tempdir()?;
    write_fixture(dir.path())?;
    let (scanner, _) = MoverScanner::open(Config::new(dir.path()))?;

    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let bars = scanner.session_bars("A", day);
    assert_eq!(bars.len(), 4);
    assert_eq!(bars[0].timestamp, at(9, 14));
    assert!(scanner.session_bars("A", day.succ_opt().unwrap()).is_empty());
    assert!(scanner.session_bars("ZZZ", day).is_empty());
    Ok(())
}
