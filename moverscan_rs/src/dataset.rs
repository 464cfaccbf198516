use std::ops::Range;

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};

use crate::schema::RawBar;

/// One bar materialised from the master dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub instrument: String,
    pub exchange: String,
    pub timestamp: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Sorted, dictionary-encoded, columnar store of every bar.
///
/// Rows are ordered by (instrument, timestamp). Instrument and exchange are
/// stored as `u32` codes into sorted dictionaries, prices as `f32`, and
/// timestamps as epoch milliseconds. Because the instrument dictionary is
/// sorted and rows are sorted by instrument first, each instrument occupies
/// one contiguous row range, recorded in `ranges`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterDataset {
    tz: FixedOffset,
    instruments: Vec<String>,
    exchanges: Vec<String>,
    instrument_codes: Vec<u32>,
    exchange_codes: Vec<u32>,
    timestamps: Vec<i64>,
    open: Vec<f32>,
    high: Vec<f32>,
    low: Vec<f32>,
    close: Vec<f32>,
    volume: Vec<Option<f32>>,
    ranges: Vec<Range<usize>>,
}

/// Plain column vectors used to move a dataset in and out of storage.
#[derive(Debug, Clone, Default)]
pub struct DatasetColumns {
    pub instrument: Vec<String>,
    pub exchange: Vec<String>,
    pub timestamp_ms: Vec<i64>,
    pub open: Vec<f32>,
    pub high: Vec<f32>,
    pub low: Vec<f32>,
    pub close: Vec<f32>,
    pub volume: Vec<Option<f32>>,
}

impl DatasetColumns {
    pub fn len(&self) -> usize {
        self.timestamp_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp_ms.is_empty()
    }
}

fn dictionary(values: impl Iterator<Item = String>) -> (Vec<String>, AHashMap<String, u32>) {
    let mut distinct: Vec<String> = values.collect();
    distinct.sort();
    distinct.dedup();
    let lookup = distinct
        .iter()
        .enumerate()
        .map(|(idx, value)| (value.clone(), idx as u32))
        .collect();
    (distinct, lookup)
}

impl MasterDataset {
    /// Merge per-file bar sequences into one sorted dataset.
    ///
    /// Sequences are concatenated in the order given and then stably sorted
    /// by (instrument, timestamp), so duplicate timestamps keep their input
    /// order. Prices are narrowed to `f32`. An empty concatenation is an
    /// error: there is no usable data to scan.
    pub fn build(sequences: Vec<Vec<RawBar>>, tz: FixedOffset) -> Result<Self> {
        let mut rows: Vec<RawBar> = sequences.into_iter().flatten().collect();
        if rows.is_empty() {
            return Err(anyhow!(
                "Ingestion produced zero usable bars across all source files"
            ));
        }
        rows.sort_by(|a, b| {
            a.instrument
                .cmp(&b.instrument)
                .then(a.timestamp_ms.cmp(&b.timestamp_ms))
        });

        let mut columns = DatasetColumns::default();
        for row in rows {
            columns.instrument.push(row.instrument);
            columns.exchange.push(row.exchange);
            columns.timestamp_ms.push(row.timestamp_ms);
            columns.open.push(row.open as f32);
            columns.high.push(row.high as f32);
            columns.low.push(row.low as f32);
            columns.close.push(row.close as f32);
            columns.volume.push(row.volume.map(|v| v as f32));
        }
        Self::from_columns(columns, tz)
    }

    /// Re-derive the compact encoding from already-sorted columns (the cache
    /// load path). The sort order is verified rather than trusted.
    pub fn from_columns(columns: DatasetColumns, tz: FixedOffset) -> Result<Self> {
        let len = columns.len();
        let lengths = [
            columns.instrument.len(),
            columns.exchange.len(),
            columns.open.len(),
            columns.high.len(),
            columns.low.len(),
            columns.close.len(),
            columns.volume.len(),
        ];
        if lengths.iter().any(|l| *l != len) {
            return Err(anyhow!("Dataset columns have mismatched lengths"));
        }
        if len == 0 {
            return Err(anyhow!("Dataset is empty"));
        }

        let (instruments, instrument_lookup) = dictionary(columns.instrument.iter().cloned());
        let (exchanges, exchange_lookup) = dictionary(columns.exchange.iter().cloned());

        let instrument_codes: Vec<u32> = columns
            .instrument
            .iter()
            .map(|name| instrument_lookup[name])
            .collect();
        let exchange_codes: Vec<u32> = columns
            .exchange
            .iter()
            .map(|name| exchange_lookup[name])
            .collect();

        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(instruments.len());
        let mut start = 0usize;
        for idx in 1..=len {
            let boundary = idx == len || instrument_codes[idx] != instrument_codes[idx - 1];
            if idx < len {
                let prev = (instrument_codes[idx - 1], columns.timestamp_ms[idx - 1]);
                let next = (instrument_codes[idx], columns.timestamp_ms[idx]);
                if next < prev {
                    return Err(anyhow!(
                        "Dataset is not sorted by (instrument, timestamp) at row {idx}"
                    ));
                }
            }
            if boundary {
                ranges.push(start..idx);
                start = idx;
            }
        }

        Ok(Self {
            tz,
            instruments,
            exchanges,
            instrument_codes,
            exchange_codes,
            timestamps: columns.timestamp_ms,
            open: columns.open,
            high: columns.high,
            low: columns.low,
            close: columns.close,
            volume: columns.volume,
            ranges,
        })
    }

    /// Expand back into plain columns for persistence.
    pub fn to_columns(&self) -> DatasetColumns {
        DatasetColumns {
            instrument: self
                .instrument_codes
                .iter()
                .map(|code| self.instruments[*code as usize].clone())
                .collect(),
            exchange: self
                .exchange_codes
                .iter()
                .map(|code| self.exchanges[*code as usize].clone())
                .collect(),
            timestamp_ms: self.timestamps.clone(),
            open: self.open.clone(),
            high: self.high.clone(),
            low: self.low.clone(),
            close: self.close.clone(),
            volume: self.volume.clone(),
        }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.len()
    }

    /// Distinct instruments in ascending order.
    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub(crate) fn instrument_ranges(&self) -> impl Iterator<Item = (&str, Range<usize>)> + '_ {
        self.instruments
            .iter()
            .zip(self.ranges.iter())
            .map(|(name, range)| (name.as_str(), range.clone()))
    }

    pub(crate) fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub(crate) fn open_at(&self, row: usize) -> f64 {
        self.open[row] as f64
    }

    pub(crate) fn high_at(&self, row: usize) -> f64 {
        self.high[row] as f64
    }

    pub(crate) fn low_at(&self, row: usize) -> f64 {
        self.low[row] as f64
    }

    pub(crate) fn close_at(&self, row: usize) -> f64 {
        self.close[row] as f64
    }

    pub fn instant(&self, timestamp_ms: i64) -> DateTime<FixedOffset> {
        self.tz
            .timestamp_millis_opt(timestamp_ms)
            .single()
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.with_timezone(&self.tz))
    }

    pub fn bar(&self, row: usize) -> Option<Bar> {
        if row >= self.len() {
            return None;
        }
        Some(Bar {
            instrument: self.instruments[self.instrument_codes[row] as usize].clone(),
            exchange: self.exchanges[self.exchange_codes[row] as usize].clone(),
            timestamp: self.instant(self.timestamps[row]),
            open: self.open_at(row),
            high: self.high_at(row),
            low: self.low_at(row),
            close: self.close_at(row),
            volume: self.volume[row].map(|v| v as f64),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Bar> + '_ {
        (0..self.len()).filter_map(|row| self.bar(row))
    }

    fn range_of(&self, instrument: &str) -> Option<Range<usize>> {
        let code = self
            .instruments
            .binary_search_by(|name| name.as_str().cmp(instrument))
            .ok()?;
        Some(self.ranges[code].clone())
    }

    /// Every bar for one instrument, in time order.
    pub fn instrument_bars(&self, instrument: &str) -> Vec<Bar> {
        self.range_of(instrument)
            .map(|range| range.filter_map(|row| self.bar(row)).collect())
            .unwrap_or_default()
    }

    /// Bars for one instrument on a calendar day in the dataset's offset.
    /// This is the full trading session a chart renderer plots around a
    /// query window.
    pub fn session_bars(&self, instrument: &str, date: NaiveDate) -> Vec<Bar> {
        let Some(range) = self.range_of(instrument) else {
            return Vec::new();
        };
        let Some(day_start) = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| self.tz.from_local_datetime(&naive).single())
        else {
            return Vec::new();
        };
        let from = day_start.timestamp_millis();
        let to = (day_start + Duration::days(1)).timestamp_millis();

        let slice = &self.timestamps[range.clone()];
        let lo = range.start + slice.partition_point(|ts| *ts < from);
        let hi = range.start + slice.partition_point(|ts| *ts < to);
        (lo..hi).filter_map(|row| self.bar(row)).collect()
    }
}
