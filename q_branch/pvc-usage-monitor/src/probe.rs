//! Recursive size measurement for a single volume directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Failure while walking a volume tree.
///
/// The walk stops at the first unreadable entry; `partial_bytes` holds the sum
/// accumulated up to that point so the caller can decide whether to keep it.
#[derive(Debug, thiserror::Error)]
#[error("failed to measure {}: {source} ({partial_bytes} bytes counted before failure)", .path.display())]
pub struct ProbeError {
    pub path: PathBuf,
    pub partial_bytes: u64,
    #[source]
    pub source: walkdir::Error,
}

/// Total size in bytes of every non-directory entry under `path`.
///
/// Symlinks are not followed; a link contributes its own size, as reported by
/// `lstat`. An empty directory measures 0. Entries are visited in file name
/// order, so `partial_bytes` on failure is the same from one walk to the next.
pub fn measure(path: &Path) -> Result<u64, ProbeError> {
    let mut total: u64 = 0;

    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let metadata = entry.and_then(|e| e.metadata()).map_err(|source| ProbeError {
            path: path.to_path_buf(),
            partial_bytes: total,
            source,
        })?;

        if !metadata.is_dir() {
            total = total.saturating_add(metadata.len());
        }
    }

    Ok(total)
}
