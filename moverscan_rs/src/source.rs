use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

/// Sentinel recorded for the mtime and size of a file that vanished between
/// listing and stat.
pub const MISSING: i64 = -1;

/// Identity of one input file as seen at scan time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Modification time in nanoseconds since the Unix epoch.
    pub modified_ns: i64,
    pub byte_size: i64,
}

impl SourceFile {
    /// Stat `path` and capture its identity. A file that cannot be stat'ed
    /// (removed mid-scan, permission lost) is recorded with the sentinel
    /// values instead of failing the scan.
    pub fn stat(path: PathBuf) -> Self {
        match fs::metadata(&path) {
            Ok(meta) => {
                let modified_ns = meta
                    .modified()
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
                    .unwrap_or(MISSING);
                let byte_size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
                Self {
                    path,
                    modified_ns,
                    byte_size,
                }
            }
            Err(error) => {
                warn!(file = %path.display(), %error, "Source file vanished during scan");
                Self::vanished(path)
            }
        }
    }

    pub fn vanished(path: PathBuf) -> Self {
        Self {
            path,
            modified_ns: MISSING,
            byte_size: MISSING,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.modified_ns == MISSING && self.byte_size == MISSING
    }
}

fn has_wanted_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// List candidate input files directly beneath `dir`, keyed and
/// de-duplicated by canonical path and returned in path order.
///
/// Subdirectories (including the cache directory) are never descended into.
/// An empty result is a fatal condition for the caller: there is nothing to
/// build a dataset from.
pub fn scan_source_dir(dir: &Path, extensions: &[String]) -> Result<Vec<SourceFile>> {
    let root = fs::canonicalize(dir)
        .with_context(|| format!("Source directory {} is not accessible", dir.display()))?;
    let entries = fs::read_dir(&root)
        .with_context(|| format!("Unable to list source directory {}", root.display()))?;

    let mut by_path: BTreeSet<PathBuf> = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Unable to list {}", root.display()))?;
        let path = entry.path();
        if !has_wanted_extension(&path, extensions) {
            continue;
        }
        // Symlinks resolve to their target so two names for one file hash once.
        let canonical = match fs::canonicalize(&path) {
            Ok(canonical) => canonical,
            Err(_) => path.clone(),
        };
        if canonical.is_dir() {
            continue;
        }
        by_path.insert(canonical);
    }

    if by_path.is_empty() {
        return Err(anyhow!(
            "No source files with extension(s) [{}] found in {}",
            extensions.join(", "),
            root.display()
        ));
    }

    let files: Vec<SourceFile> = by_path.into_iter().map(SourceFile::stat).collect();
    info!(
        dir = %root.display(),
        files = files.len(),
        "Scanned source directory"
    );
    Ok(files)
}
