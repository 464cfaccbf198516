use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::dataset::MasterDataset;
use crate::identity::cache_identity;
use crate::ingest::{IngestReport, IngestionPool};
use crate::source::{SourceFile, scan_source_dir};
use crate::storage::{CacheLayout, CacheManifest, CacheProbe, MissReason};

/// How the master dataset for this session was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Rebuilt { reason: MissReason },
}

/// A resolved master dataset plus everything a caller may want to report.
#[derive(Debug)]
pub struct ResolvedDataset {
    pub dataset: Arc<MasterDataset>,
    pub hash: String,
    pub manifest: CacheManifest,
    pub outcome: CacheOutcome,
    /// Present only when the dataset was rebuilt from source.
    pub ingest: Option<IngestReport>,
    pub pruned: Vec<PathBuf>,
    pub elapsed_ms: u64,
}

/// Owns the cache protocol for one source directory:
/// identity check, then load on hit or ingest-build-persist-prune on miss.
#[derive(Debug, Clone)]
pub struct MasterStore {
    config: Config,
    layout: CacheLayout,
}

impl MasterStore {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let layout = CacheLayout::new(config.cache_dir());
        Ok(Self { config, layout })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// List inputs and derive the current cache key.
    pub fn identify(&self) -> Result<(Vec<SourceFile>, String)> {
        let files = scan_source_dir(&self.config.source_dir, &self.config.extensions)?;
        let hash = cache_identity(&files);
        Ok((files, hash))
    }

    /// Identity-check phase. A forced rebuild always reports a miss.
    pub fn probe(&self, hash: &str) -> CacheProbe {
        if self.config.force_rebuild {
            return CacheProbe::Miss(MissReason::Forced);
        }
        self.layout
            .probe(hash, self.config.timezone_offset_minutes)
    }

    /// Resolve the master dataset for the current source files.
    pub fn resolve(&self) -> Result<ResolvedDataset> {
        let start = Instant::now();
        let (files, hash) = self.identify()?;

        let reason = match self.probe(&hash) {
            CacheProbe::Hit(manifest) => match self.load_hit(&manifest) {
                Ok(dataset) => {
                    let elapsed_ms = (start.elapsed().as_secs_f32() * 1000.0).round() as u64;
                    info!(
                        hash = %hash,
                        rows = dataset.len(),
                        instruments = dataset.instrument_count(),
                        elapsed_ms,
                        "Master dataset cache hit"
                    );
                    return Ok(ResolvedDataset {
                        dataset: Arc::new(dataset),
                        hash,
                        manifest,
                        outcome: CacheOutcome::Hit,
                        ingest: None,
                        pruned: Vec::new(),
                        elapsed_ms,
                    });
                }
                Err(err) => {
                    warn!(
                        hash = %hash,
                        error = %format!("{err:#}"),
                        "Cached master dataset failed validation; rebuilding"
                    );
                    MissReason::CorruptArtifact(format!("{err:#}"))
                }
            },
            CacheProbe::Miss(reason) => reason,
        };

        info!(hash = %hash, reason = %reason, "Master dataset cache miss; rebuilding from source");
        let (dataset, manifest, ingest) = self.build(&files, &hash)?;
        let pruned = self
            .layout
            .prune(&hash)
            .context("Failed to prune stale cache artifacts")?;
        let elapsed_ms = (start.elapsed().as_secs_f32() * 1000.0).round() as u64;
        info!(
            hash = %hash,
            rows = dataset.len(),
            instruments = dataset.instrument_count(),
            pruned = pruned.len(),
            elapsed_ms,
            "Master dataset rebuilt"
        );
        Ok(ResolvedDataset {
            dataset: Arc::new(dataset),
            hash,
            manifest,
            outcome: CacheOutcome::Rebuilt { reason },
            ingest: Some(ingest),
            pruned,
            elapsed_ms,
        })
    }

    fn load_hit(&self, manifest: &CacheManifest) -> Result<MasterDataset> {
        self.layout.load(manifest, self.config.timezone()?)
    }

    /// Miss phase: ingest, merge, persist. Fails when no file yields a usable
    /// bar or when the artifact cannot be written.
    pub fn build(
        &self,
        files: &[SourceFile],
        hash: &str,
    ) -> Result<(MasterDataset, CacheManifest, IngestReport)> {
        let tz = self.config.timezone()?;
        let pool = IngestionPool::new(self.config.worker_count(), tz);
        let (sequences, report) = pool.ingest(files)?;
        let dataset = MasterDataset::build(sequences, tz).with_context(|| {
            format!(
                "No usable data in {} ({} of {} files failed)",
                self.config.source_dir.display(),
                report.failures.len(),
                report.files_scanned
            )
        })?;
        let manifest = CacheManifest::describe(&dataset, hash, files.len());
        self.layout
            .persist(&dataset, &manifest)
            .context("Failed to write master dataset cache")?;
        Ok((dataset, manifest, report))
    }
}
