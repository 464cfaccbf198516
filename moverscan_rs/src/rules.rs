use serde::Serialize;

use crate::config::{ScanMode, Tolerance};
use crate::window::WindowAggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    Gainer,
    Loser,
    None,
}

/// A window aggregate classified by the first-bar wick rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoverRecord {
    #[serde(flatten)]
    pub aggregate: WindowAggregate,
    pub low_equals_open: bool,
    pub high_equals_open: bool,
    pub eligibility: Eligibility,
}

impl MoverRecord {
    pub fn instrument(&self) -> &str {
        &self.aggregate.instrument
    }

    pub fn pct_change(&self) -> f64 {
        self.aggregate.pct_change
    }

    pub fn is_eligible(&self) -> bool {
        self.eligibility != Eligibility::None
    }
}

/// Apply the wick rule to one aggregate.
///
/// A rise only counts when the window's first bar never traded below the
/// window open; a fall only counts when it never traded above it.
pub fn classify(aggregate: WindowAggregate, tolerance: &Tolerance) -> MoverRecord {
    let low_equals_open = tolerance.close(aggregate.first_bar_low, aggregate.open_in_window);
    let high_equals_open = tolerance.close(aggregate.first_bar_high, aggregate.open_in_window);
    let pct = aggregate.pct_change;
    let eligibility = if pct > 0.0 && low_equals_open {
        Eligibility::Gainer
    } else if pct < 0.0 && high_equals_open {
        Eligibility::Loser
    } else {
        Eligibility::None
    };
    MoverRecord {
        aggregate,
        low_equals_open,
        high_equals_open,
        eligibility,
    }
}

/// Classify every aggregate and keep the eligible ones selected by `mode`,
/// preserving input order.
pub fn filter_eligible(
    aggregates: Vec<WindowAggregate>,
    tolerance: &Tolerance,
    mode: ScanMode,
) -> Vec<MoverRecord> {
    aggregates
        .into_iter()
        .map(|aggregate| classify(aggregate, tolerance))
        .filter(|record| match (mode, record.eligibility) {
            (_, Eligibility::None) => false,
            (ScanMode::Both, _) => true,
            (ScanMode::Gainers, Eligibility::Gainer) => true,
            (ScanMode::Losers, Eligibility::Loser) => true,
            _ => false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn aggregate(name: &str, open: f64, close: f64, low: f64, high: f64) -> WindowAggregate {
        let ts = FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 1, 9, 15, 0)
            .single()
            .unwrap();
        WindowAggregate {
            instrument: name.to_string(),
            open_in_window: open,
            close_in_window: close,
            pct_change: (close - open) / open * 100.0,
            first_bar_low: low,
            first_bar_high: high,
            first_timestamp: ts,
            last_timestamp: ts,
            bar_count: 2,
        }
    }

    #[test]
    fn gainer_requires_first_low_at_open() {
        let tol = Tolerance::default();
        let exact = classify(aggregate("A", 100.0, 110.0, 100.0, 103.0), &tol);
        assert_eq!(exact.eligibility, Eligibility::Gainer);
        assert!(exact.low_equals_open);
        assert!(!exact.high_equals_open);

        let wicked = classify(
            aggregate("A", 100.0, 110.0, 100.0 + tol.abs * 2.0, 103.0),
            &tol,
        );
        assert_eq!(wicked.eligibility, Eligibility::None);
        assert!(!wicked.low_equals_open);
    }

    #[test]
    fn loser_requires_first_high_at_open() {
        let tol = Tolerance::default();
        let clean = classify(aggregate("B", 200.0, 150.0, 195.0, 200.0), &tol);
        assert_eq!(clean.eligibility, Eligibility::Loser);

        let wicked = classify(aggregate("B", 200.0, 150.0, 195.0, 201.0), &tol);
        assert_eq!(wicked.eligibility, Eligibility::None);
    }

    #[test]
    fn flat_window_is_never_eligible() {
        let tol = Tolerance::default();
        let flat = classify(aggregate("C", 100.0, 100.0, 100.0, 100.0), &tol);
        assert!(flat.low_equals_open && flat.high_equals_open);
        assert_eq!(flat.eligibility, Eligibility::None);
    }

    #[test]
    fn mode_selects_sides_and_keeps_order() {
        let tol = Tolerance::default();
        let input = || {
            vec![
                aggregate("UP1", 100.0, 105.0, 100.0, 106.0),
                aggregate("DOWN", 100.0, 95.0, 94.0, 100.0),
                aggregate("NOISE", 100.0, 105.0, 98.0, 106.0),
                aggregate("UP2", 100.0, 101.0, 100.0, 101.0),
            ]
        };
        let names = |records: Vec<MoverRecord>| -> Vec<String> {
            records
                .iter()
                .map(|r| r.instrument().to_string())
                .collect()
        };
        assert_eq!(
            names(filter_eligible(input(), &tol, ScanMode::Both)),
            vec!["UP1", "DOWN", "UP2"]
        );
        assert_eq!(
            names(filter_eligible(input(), &tol, ScanMode::Gainers)),
            vec!["UP1", "UP2"]
        );
        assert_eq!(
            names(filter_eligible(input(), &tol, ScanMode::Losers)),
            vec!["DOWN"]
        );
    }
}
