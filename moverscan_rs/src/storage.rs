use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{FixedOffset, Utc};
use polars::io::parquet::write::{ParquetCompression, ParquetWriter};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{DatasetColumns, MasterDataset};
use crate::identity::looks_like_identity;
use crate::schema::{
    CANONICAL_COLUMNS, COL_CLOSE, COL_EXCHANGE, COL_HIGH, COL_INSTRUMENT, COL_LOW, COL_OPEN,
    COL_TIMESTAMP, COL_VOLUME,
};

const ARTIFACT_PREFIX: &str = "master-";
const ARTIFACT_EXT: &str = "parquet";
const MANIFEST_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// Sidecar describing one persisted master dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub hash: String,
    #[serde(rename = "rows")]
    pub row_count: usize,
    #[serde(rename = "instruments")]
    pub instrument_count: usize,
    #[serde(rename = "columns")]
    pub column_names: Vec<String>,
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub source_files: usize,
    #[serde(default)]
    pub created_at: String,
}

impl CacheManifest {
    pub fn describe(dataset: &MasterDataset, hash: &str, source_files: usize) -> Self {
        Self {
            hash: hash.to_string(),
            row_count: dataset.len(),
            instrument_count: dataset.instrument_count(),
            column_names: CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
            timezone_offset_minutes: dataset.timezone().local_minus_utc() / 60,
            source_files,
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        }
    }

    /// Check that a freshly loaded dataset matches what this manifest promised.
    pub fn verify(&self, dataset: &MasterDataset) -> Result<()> {
        if self.row_count != dataset.len() {
            return Err(anyhow!(
                "artifact holds {} rows but manifest records {}",
                dataset.len(),
                self.row_count
            ));
        }
        if self.instrument_count != dataset.instrument_count() {
            return Err(anyhow!(
                "artifact holds {} instruments but manifest records {}",
                dataset.instrument_count(),
                self.instrument_count
            ));
        }
        Ok(())
    }
}

/// Why a probe did not produce a trusted cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NoManifest,
    UnreadableManifest(String),
    HashMismatch { recorded: String },
    SchemaMismatch,
    TimezoneMismatch { recorded: i32 },
    ArtifactMissing,
    CorruptArtifact(String),
    Forced,
}

impl std::fmt::Display for MissReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissReason::NoManifest => write!(f, "no manifest for current source identity"),
            MissReason::UnreadableManifest(err) => write!(f, "manifest unreadable: {err}"),
            MissReason::HashMismatch { recorded } => {
                write!(f, "manifest records a different hash ({recorded})")
            }
            MissReason::SchemaMismatch => write!(f, "manifest column list differs"),
            MissReason::TimezoneMismatch { recorded } => {
                write!(f, "manifest built for offset {recorded} minutes")
            }
            MissReason::ArtifactMissing => write!(f, "artifact file missing"),
            MissReason::CorruptArtifact(err) => write!(f, "artifact failed validation: {err}"),
            MissReason::Forced => write!(f, "rebuild forced"),
        }
    }
}

/// Outcome of the identity check phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheProbe {
    Hit(CacheManifest),
    Miss(MissReason),
}

/// Classify what was found on disk for `hash`. Pure: all filesystem reads
/// happen in [`CacheLayout::probe`], which feeds this function.
pub fn classify(
    hash: &str,
    manifest: Option<Result<CacheManifest, String>>,
    artifact_present: bool,
    timezone_offset_minutes: i32,
) -> CacheProbe {
    let manifest = match manifest {
        None => return CacheProbe::Miss(MissReason::NoManifest),
        Some(Err(err)) => return CacheProbe::Miss(MissReason::UnreadableManifest(err)),
        Some(Ok(manifest)) => manifest,
    };
    if manifest.hash != hash {
        return CacheProbe::Miss(MissReason::HashMismatch {
            recorded: manifest.hash,
        });
    }
    if manifest.column_names != CANONICAL_COLUMNS {
        return CacheProbe::Miss(MissReason::SchemaMismatch);
    }
    if manifest.timezone_offset_minutes != timezone_offset_minutes {
        return CacheProbe::Miss(MissReason::TimezoneMismatch {
            recorded: manifest.timezone_offset_minutes,
        });
    }
    if !artifact_present {
        return CacheProbe::Miss(MissReason::ArtifactMissing);
    }
    CacheProbe::Hit(manifest)
}

/// File naming and persistence inside the cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    dir: PathBuf,
}

impl CacheLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.dir
            .join(format!("{ARTIFACT_PREFIX}{hash}.{ARTIFACT_EXT}"))
    }

    pub fn manifest_path(&self, hash: &str) -> PathBuf {
        self.dir
            .join(format!("{ARTIFACT_PREFIX}{hash}.{MANIFEST_EXT}"))
    }

    pub fn read_manifest(&self, hash: &str) -> Option<Result<CacheManifest, String>> {
        let path = self.manifest_path(hash);
        if !path.exists() {
            return None;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                serde_json::from_str::<CacheManifest>(&raw).map_err(|err| err.to_string())
            });
        Some(parsed)
    }

    pub fn probe(&self, hash: &str, timezone_offset_minutes: i32) -> CacheProbe {
        classify(
            hash,
            self.read_manifest(hash),
            self.artifact_path(hash).is_file(),
            timezone_offset_minutes,
        )
    }

    /// Persist the dataset and its manifest under `hash`.
    ///
    /// Both files are written to temporary names and renamed into place,
    /// artifact first, so a manifest only ever appears next to a complete
    /// artifact.
    pub fn persist(&self, dataset: &MasterDataset, manifest: &CacheManifest) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Unable to create cache directory {}", self.dir.display()))?;
        let start = Instant::now();

        let artifact = self.artifact_path(&manifest.hash);
        let artifact_tmp = temp_path(&artifact);
        let mut frame = dataset_to_frame(dataset)?;
        {
            let mut file = File::create(&artifact_tmp)
                .with_context(|| format!("Unable to create {}", artifact_tmp.display()))?;
            ParquetWriter::new(&mut file)
                .with_compression(ParquetCompression::Zstd(None))
                .finish(&mut frame)
                .context("Failed to write master dataset artifact")?;
            file.sync_all()
                .with_context(|| format!("Unable to flush {}", artifact_tmp.display()))?;
        }
        fs::rename(&artifact_tmp, &artifact)
            .with_context(|| format!("Unable to move artifact into {}", artifact.display()))?;

        let manifest_file = self.manifest_path(&manifest.hash);
        let manifest_tmp = temp_path(&manifest_file);
        {
            let mut file = File::create(&manifest_tmp)
                .with_context(|| format!("Unable to create {}", manifest_tmp.display()))?;
            let body = serde_json::to_vec_pretty(manifest)?;
            file.write_all(&body)
                .with_context(|| format!("Unable to write {}", manifest_tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("Unable to flush {}", manifest_tmp.display()))?;
        }
        fs::rename(&manifest_tmp, &manifest_file).with_context(|| {
            format!("Unable to move manifest into {}", manifest_file.display())
        })?;

        info!(
            artifact = %artifact.display(),
            rows = manifest.row_count,
            instruments = manifest.instrument_count,
            write_ms = (start.elapsed().as_secs_f32() * 1000.0).round() as u64,
            "Master dataset cached"
        );
        Ok(())
    }

    /// Load the artifact recorded by `manifest` and check it against the
    /// manifest's counts.
    pub fn load(&self, manifest: &CacheManifest, tz: FixedOffset) -> Result<MasterDataset> {
        let path = self.artifact_path(&manifest.hash);
        let file =
            File::open(&path).with_context(|| format!("Unable to open {}", path.display()))?;
        let frame = ParquetReader::new(file)
            .finish()
            .with_context(|| format!("Failed to read master dataset {}", path.display()))?;
        let dataset = frame_to_dataset(&frame, tz)
            .with_context(|| format!("Malformed master dataset {}", path.display()))?;
        manifest.verify(&dataset)?;
        Ok(dataset)
    }

    /// Remove every cache file whose embedded hash differs from `keep_hash`,
    /// including stray temporaries. Returns the removed paths.
    pub fn prune(&self, keep_hash: &str) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if !self.dir.exists() {
            return Ok(removed);
        }
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Unable to list cache directory {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(embedded) = embedded_hash(&name) else {
                continue;
            };
            if embedded == keep_hash && !name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(file = %path.display(), "Pruned stale cache file");
                    removed.push(path);
                }
                Err(error) => {
                    warn!(file = %path.display(), %error, "Unable to prune stale cache file");
                }
            }
        }
        Ok(removed)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Extract the identity digest from a cache file name such as
/// `master-<hash>.parquet` or `master-<hash>.json.tmp`.
fn embedded_hash(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(ARTIFACT_PREFIX)?;
    let (hash, _) = rest.split_once('.')?;
    looks_like_identity(hash).then_some(hash)
}

fn dataset_to_frame(dataset: &MasterDataset) -> Result<DataFrame> {
    let columns = dataset.to_columns();
    let timestamp = Series::new(COL_TIMESTAMP, columns.timestamp_ms)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
        .context("Failed to encode timestamp column")?;
    DataFrame::new(vec![
        Series::new(COL_INSTRUMENT, columns.instrument),
        Series::new(COL_EXCHANGE, columns.exchange),
        timestamp,
        Series::new(COL_OPEN, columns.open),
        Series::new(COL_HIGH, columns.high),
        Series::new(COL_LOW, columns.low),
        Series::new(COL_CLOSE, columns.close),
        Series::new(COL_VOLUME, columns.volume),
    ])
    .context("Failed to build master dataset frame")
}

fn string_column(frame: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = frame
        .column(name)
        .with_context(|| format!("Missing column '{name}'"))?;
    series
        .str()
        .with_context(|| format!("Column '{name}' must be text"))?
        .into_iter()
        .map(|value| {
            value
                .map(str::to_string)
                .ok_or_else(|| anyhow!("Column '{name}' contains nulls"))
        })
        .collect()
}

fn price_column(frame: &DataFrame, name: &str) -> Result<Vec<f32>> {
    let series = frame
        .column(name)
        .with_context(|| format!("Missing column '{name}'"))?;
    series
        .f32()
        .with_context(|| format!("Column '{name}' must be float32"))?
        .into_iter()
        .map(|value| value.ok_or_else(|| anyhow!("Column '{name}' contains nulls")))
        .collect()
}

fn timestamp_column(frame: &DataFrame) -> Result<Vec<i64>> {
    let series = frame
        .column(COL_TIMESTAMP)
        .with_context(|| format!("Missing column '{COL_TIMESTAMP}'"))?;
    let DataType::Datetime(unit, _) = series.dtype() else {
        return Err(anyhow!(
            "Column '{COL_TIMESTAMP}' must be a datetime (got {:?})",
            series.dtype()
        ));
    };
    let scale = |value: i64| match unit {
        TimeUnit::Nanoseconds => value.div_euclid(1_000_000),
        TimeUnit::Microseconds => value.div_euclid(1_000),
        TimeUnit::Milliseconds => value,
    };
    series
        .datetime()
        .context("Failed to interpret timestamp column")?
        .into_iter()
        .map(|value| {
            value
                .map(scale)
                .ok_or_else(|| anyhow!("Column '{COL_TIMESTAMP}' contains nulls"))
        })
        .collect()
}

fn frame_to_dataset(frame: &DataFrame, tz: FixedOffset) -> Result<MasterDataset> {
    let volume = frame
        .column(COL_VOLUME)
        .with_context(|| format!("Missing column '{COL_VOLUME}'"))?
        .f32()
        .with_context(|| format!("Column '{COL_VOLUME}' must be float32"))?
        .into_iter()
        .collect();
    let columns = DatasetColumns {
        instrument: string_column(frame, COL_INSTRUMENT)?,
        exchange: string_column(frame, COL_EXCHANGE)?,
        timestamp_ms: timestamp_column(frame)?,
        open: price_column(frame, COL_OPEN)?,
        high: price_column(frame, COL_HIGH)?,
        low: price_column(frame, COL_LOW)?,
        close: price_column(frame, COL_CLOSE)?,
        volume,
    };
    MasterDataset::from_columns(columns, tz)
}
