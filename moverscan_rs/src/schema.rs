use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;

/// Canonical bar columns, in persisted order.
pub const COL_INSTRUMENT: &str = "instrument";
pub const COL_EXCHANGE: &str = "exchange";
pub const COL_TIMESTAMP: &str = "timestamp";
pub const COL_OPEN: &str = "open";
pub const COL_HIGH: &str = "high";
pub const COL_LOW: &str = "low";
pub const COL_CLOSE: &str = "close";
pub const COL_VOLUME: &str = "volume";

pub const CANONICAL_COLUMNS: [&str; 8] = [
    COL_INSTRUMENT,
    COL_EXCHANGE,
    COL_TIMESTAMP,
    COL_OPEN,
    COL_HIGH,
    COL_LOW,
    COL_CLOSE,
    COL_VOLUME,
];

/// Source header spellings (lower-cased) mapped to their canonical column.
static COLUMN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for alias in ["instrument", "symbol", "tradingsymbol", "trading_symbol", "ticker"] {
        m.insert(alias, COL_INSTRUMENT);
    }
    for alias in ["exchange", "exch", "segment"] {
        m.insert(alias, COL_EXCHANGE);
    }
    for alias in ["timestamp", "datetime", "date", "time"] {
        m.insert(alias, COL_TIMESTAMP);
    }
    for alias in ["open", "o"] {
        m.insert(alias, COL_OPEN);
    }
    for alias in ["high", "h"] {
        m.insert(alias, COL_HIGH);
    }
    for alias in ["low", "l"] {
        m.insert(alias, COL_LOW);
    }
    for alias in ["close", "c"] {
        m.insert(alias, COL_CLOSE);
    }
    for alias in ["volume", "vol", "v"] {
        m.insert(alias, COL_VOLUME);
    }
    m
});

/// Resolve a source header to its canonical column name, if it has one.
pub fn canonical_column(header: &str) -> Option<&'static str> {
    let key = header.trim().to_ascii_lowercase();
    COLUMN_ALIASES.get(key.as_str()).copied()
}

/// Position of each canonical column within a source header row.
///
/// The first header that resolves to a canonical column wins, so a file
/// carrying both `date` and `timestamp` uses whichever comes first.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    positions: HashMap<&'static str, usize>,
}

impl ColumnMapping {
    pub fn resolve<S: AsRef<str>>(headers: &[S]) -> Self {
        let mut positions = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(canonical) = canonical_column(header.as_ref()) {
                positions.entry(canonical).or_insert(idx);
            }
        }
        Self { positions }
    }

    pub fn position(&self, canonical: &str) -> Option<usize> {
        self.positions.get(canonical).copied()
    }

    /// Required canonical columns absent from the header row. Volume is
    /// optional and never reported.
    pub fn missing_required(&self) -> Vec<&'static str> {
        CANONICAL_COLUMNS
            .iter()
            .copied()
            .filter(|name| *name != COL_VOLUME && !self.positions.contains_key(name))
            .collect()
    }
}

/// One validated input row. Every field except volume is guaranteed present.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub instrument: String,
    pub exchange: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Parse a numeric cell; blanks and unparseable text become missing.
pub fn parse_number(raw: Option<&str>) -> Option<f64> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Parse a text cell; blank values become missing.
pub fn parse_label(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

const AWARE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d-%m-%Y %H:%M:%S",
];

/// Parse a timestamp cell into the fixed target offset.
///
/// Offset-carrying values are converted into `tz`; naive values are taken
/// to already be wall-clock time in `tz`.
pub fn parse_timestamp(raw: Option<&str>, tz: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let text = raw?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(tz));
    }
    for format in AWARE_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, format) {
            return Some(parsed.with_timezone(tz));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return tz.from_local_datetime(&naive).single();
        }
    }
    None
}
