use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::config::{ChartMode, Config, ScanMode};
use crate::dataset::{Bar, MasterDataset};
use crate::master::{MasterStore, ResolvedDataset};
use crate::rank::{chart_candidates, leaderboard};
use crate::rules::{MoverRecord, filter_eligible};
use crate::window::{Window, aggregate_window};

/// Output of one window query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanResult {
    pub mode: ScanMode,
    pub chart_mode: ChartMode,
    /// Number of instruments with at least one bar in the window.
    pub instruments_in_window: usize,
    pub leaderboard: Vec<MoverRecord>,
    pub chart_candidates: Vec<MoverRecord>,
}

impl ScanResult {
    pub fn is_empty(&self) -> bool {
        self.leaderboard.is_empty()
    }
}

/// Read-only query surface over a shared master dataset snapshot.
#[derive(Debug, Clone)]
pub struct MoverScanner {
    dataset: Arc<MasterDataset>,
    config: Config,
}

impl MoverScanner {
    pub fn new(dataset: Arc<MasterDataset>, config: &Config) -> Self {
        Self {
            dataset,
            config: config.clone(),
        }
    }

    /// Resolve the master dataset for `config` (cache hit or rebuild) and
    /// wrap it in a scanner. The resolution details are returned alongside
    /// for reporting.
    pub fn open(config: Config) -> Result<(Self, ResolvedDataset)> {
        let store = MasterStore::new(config)?;
        let resolved = store.resolve()?;
        let scanner = Self::new(Arc::clone(&resolved.dataset), store.config());
        Ok((scanner, resolved))
    }

    pub fn dataset(&self) -> &Arc<MasterDataset> {
        &self.dataset
    }

    pub fn query(&self, window: &Window, mode: ScanMode) -> ScanResult {
        let start = Instant::now();
        let chart_mode = self.config.effective_chart_mode(mode);

        let aggregates = aggregate_window(&self.dataset, window);
        let instruments_in_window = aggregates.len();
        let eligible = filter_eligible(aggregates, &self.config.tolerance, mode);
        let leaderboard = leaderboard(&eligible);
        let chart_candidates = chart_candidates(&eligible, chart_mode, self.config.top_k);

        info!(
            from = %window.start().to_rfc3339(),
            to = %window.end().to_rfc3339(),
            mode = ?mode,
            instruments = instruments_in_window,
            eligible = leaderboard.len(),
            charted = chart_candidates.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Window scan complete"
        );

        ScanResult {
            mode,
            chart_mode,
            instruments_in_window,
            leaderboard,
            chart_candidates,
        }
    }

    pub fn session_bars(&self, instrument: &str, date: NaiveDate) -> Vec<Bar> {
        self.dataset.session_bars(instrument, date)
    }
}
