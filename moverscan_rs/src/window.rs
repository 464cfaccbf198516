use anyhow::{Result, anyhow};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::dataset::MasterDataset;

/// A validated closed interval `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    from: DateTime<FixedOffset>,
    to: DateTime<FixedOffset>,
}

impl Window {
    pub fn new(from: DateTime<FixedOffset>, to: DateTime<FixedOffset>) -> Result<Self> {
        if to < from {
            return Err(anyhow!(
                "Window end {} is before window start {}",
                to.to_rfc3339(),
                from.to_rfc3339()
            ));
        }
        Ok(Self { from, to })
    }

    pub fn start(&self) -> DateTime<FixedOffset> {
        self.from
    }

    pub fn end(&self) -> DateTime<FixedOffset> {
        self.to
    }
}

/// Per-instrument summary of the bars inside one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowAggregate {
    pub instrument: String,
    pub open_in_window: f64,
    pub close_in_window: f64,
    pub pct_change: f64,
    pub first_bar_low: f64,
    pub first_bar_high: f64,
    pub first_timestamp: DateTime<FixedOffset>,
    pub last_timestamp: DateTime<FixedOffset>,
    pub bar_count: usize,
}

/// Summarise every instrument with at least one bar in `window`.
///
/// Each instrument's rows are contiguous and time-sorted, so the in-window
/// slice is found by binary search. Output follows instrument order. An
/// instrument whose window open is zero has no defined percentage change and
/// is left out.
pub fn aggregate_window(dataset: &MasterDataset, window: &Window) -> Vec<WindowAggregate> {
    let from = window.from.timestamp_millis();
    let to = window.to.timestamp_millis();
    let timestamps = dataset.timestamps();

    let mut out = Vec::new();
    for (instrument, range) in dataset.instrument_ranges() {
        let slice = &timestamps[range.clone()];
        let lo = range.start + slice.partition_point(|ts| *ts < from);
        let hi = range.start + slice.partition_point(|ts| *ts <= to);
        if lo >= hi {
            continue;
        }
        let first = lo;
        let last = hi - 1;

        let open = dataset.open_at(first);
        let close = dataset.close_at(last);
        if open == 0.0 {
            continue;
        }
        out.push(WindowAggregate {
            instrument: instrument.to_string(),
            open_in_window: open,
            close_in_window: close,
            pct_change: (close - open) / open * 100.0,
            first_bar_low: dataset.low_at(first),
            first_bar_high: dataset.high_at(first),
            first_timestamp: dataset.instant(timestamps[first]),
            last_timestamp: dataset.instant(timestamps[last]),
            bar_count: hi - lo,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RawBar;
    use chrono::TimeZone;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        ist().with_ymd_and_hms(2024, 3, 1, h, m, 0).single().unwrap()
    }

    fn bar(instrument: &str, h: u32, m: u32, open: f64, close: f64) -> RawBar {
        RawBar {
            instrument: instrument.to_string(),
            exchange: "NSE".to_string(),
            timestamp_ms: at(h, m).timestamp_millis(),
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume: None,
        }
    }

    fn dataset() -> MasterDataset {
        MasterDataset::build(
            vec![
                vec![
                    bar("AAA", 9, 14, 90.0, 95.0),
                    bar("AAA", 9, 15, 100.0, 104.0),
                    bar("AAA", 9, 16, 104.0, 108.0),
                    bar("AAA", 9, 17, 108.0, 110.0),
                    bar("AAA", 9, 18, 110.0, 200.0),
                ],
                vec![bar("BBB", 10, 0, 50.0, 51.0)],
            ],
            ist(),
        )
        .unwrap()
    }

    #[test]
    fn window_rejects_reversed_bounds() {
        assert!(Window::new(at(9, 20), at(9, 15)).is_err());
        assert!(Window::new(at(9, 15), at(9, 15)).is_ok());
    }

    #[test]
    fn aggregate_uses_first_and_last_bar_inside_closed_interval() -> Result<()> {
        let window = Window::new(at(9, 15), at(9, 17))?;
        let aggregates = aggregate_window(&dataset(), &window);
        assert_eq!(aggregates.len(), 1);
        let agg = &aggregates[0];
        assert_eq!(agg.instrument, "AAA");
        assert_eq!(agg.open_in_window, 100.0);
        assert_eq!(agg.close_in_window, 110.0);
        assert!((agg.pct_change - 10.0).abs() < 1e-9);
        assert_eq!(agg.first_bar_low, 99.0);
        assert_eq!(agg.first_bar_high, 105.0);
        assert_eq!(agg.first_timestamp, at(9, 15));
        assert_eq!(agg.last_timestamp, at(9, 17));
        assert_eq!(agg.bar_count, 3);
        Ok(())
    }

    #[test]
    fn single_instant_window_selects_one_bar() -> Result<()> {
        let window = Window::new(at(10, 0), at(10, 0))?;
        let aggregates = aggregate_window(&dataset(), &window);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].instrument, "BBB");
        assert_eq!(aggregates[0].bar_count, 1);
        Ok(())
    }

    #[test]
    fn empty_window_yields_no_aggregates() -> Result<()> {
        let window = Window::new(at(12, 0), at(13, 0))?;
        assert!(aggregate_window(&dataset(), &window).is_empty());
        Ok(())
    }

    #[test]
    fn output_follows_instrument_order() -> Result<()> {
        let window = Window::new(at(9, 0), at(11, 0))?;
        let names: Vec<String> = aggregate_window(&dataset(), &window)
            .into_iter()
            .map(|agg| agg.instrument)
            .collect();
        assert_eq!(names, vec!["AAA".to_string(), "BBB".to_string()]);
        Ok(())
    }
}
