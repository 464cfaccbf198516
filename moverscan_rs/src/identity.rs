use sha2::{Digest, Sha256};

use crate::source::SourceFile;

/// Length in hex characters of a cache identity digest.
pub const IDENTITY_HEX_LEN: usize = 64;

/// Derive the cache key for a set of source files.
///
/// Files are ordered by absolute path, then each contributes its path bytes,
/// its mtime and its byte size (little-endian i64) to a SHA-256 accumulator.
/// Vanished files contribute the `(-1, -1)` sentinel. Only identity metadata
/// is hashed, never file contents, so a rewrite that preserves both mtime and
/// size keeps the old key.
pub fn cache_identity(files: &[SourceFile]) -> String {
    let mut ordered: Vec<&SourceFile> = files.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for file in ordered {
        hasher.update(file.path.as_os_str().as_encoded_bytes());
        // Separator keeps "a" + mtime from aliasing a path that happens to
        // end with the same bytes.
        hasher.update([0u8]);
        hasher.update(file.modified_ns.to_le_bytes());
        hasher.update(file.byte_size.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// True when `value` has the shape of a digest produced by [`cache_identity`].
pub fn looks_like_identity(value: &str) -> bool {
    value.len() == IDENTITY_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(path: &str, mtime: i64, size: i64) -> SourceFile {
        SourceFile {
            path: PathBuf::from(path),
            modified_ns: mtime,
            byte_size: size,
        }
    }

    #[test]
    fn identity_is_deterministic_and_order_independent() {
        let a = vec![file("/d/a.csv", 10, 100), file("/d/b.csv", 20, 200)];
        let b = vec![file("/d/b.csv", 20, 200), file("/d/a.csv", 10, 100)];
        let first = cache_identity(&a);
        assert_eq!(first, cache_identity(&a));
        assert_eq!(first, cache_identity(&b));
        assert!(looks_like_identity(&first));
    }

    #[test]
    fn identity_changes_with_any_component() {
        let base = vec![file("/d/a.csv", 10, 100), file("/d/b.csv", 20, 200)];
        let digest = cache_identity(&base);

        let mtime = vec![file("/d/a.csv", 11, 100), file("/d/b.csv", 20, 200)];
        let size = vec![file("/d/a.csv", 10, 101), file("/d/b.csv", 20, 200)];
        let path = vec![file("/d/a2.csv", 10, 100), file("/d/b.csv", 20, 200)];
        let added = vec![
            file("/d/a.csv", 10, 100),
            file("/d/b.csv", 20, 200),
            file("/d/c.csv", 30, 300),
        ];
        let removed = vec![file("/d/a.csv", 10, 100)];

        for changed in [mtime, size, path, added, removed] {
            assert_ne!(digest, cache_identity(&changed));
        }
    }

    #[test]
    fn vanished_file_sentinel_differs_from_present_file() {
        let present = vec![file("/d/a.csv", 10, 100)];
        let vanished = vec![SourceFile::vanished(PathBuf::from("/d/a.csv"))];
        assert_ne!(cache_identity(&present), cache_identity(&vanished));
    }
}
