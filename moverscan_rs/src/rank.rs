use std::cmp::Ordering;

use crate::config::ChartMode;
use crate::rules::MoverRecord;

/// Full ranking of the eligible set, pct_change descending.
///
/// `sort_by` is stable, so ties keep the aggregator's instrument order.
pub fn leaderboard(eligible: &[MoverRecord]) -> Vec<MoverRecord> {
    let mut ranked = eligible.to_vec();
    ranked.sort_by(|a, b| descending(a.pct_change(), b.pct_change()));
    ranked
}

/// At most `k` chart candidates selected from the eligible set.
pub fn chart_candidates(eligible: &[MoverRecord], mode: ChartMode, k: usize) -> Vec<MoverRecord> {
    let mut ranked = eligible.to_vec();
    match mode {
        ChartMode::Gainers => ranked.sort_by(|a, b| descending(a.pct_change(), b.pct_change())),
        ChartMode::Losers => ranked.sort_by(|a, b| a.pct_change().total_cmp(&b.pct_change())),
        ChartMode::Abs => {
            ranked.sort_by(|a, b| descending(a.pct_change().abs(), b.pct_change().abs()))
        }
    }
    ranked.truncate(k);
    ranked
}

fn descending(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}
