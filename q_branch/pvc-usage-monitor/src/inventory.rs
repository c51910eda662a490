//! Local volume discovery under the provisioner root directory.
//!
//! Each immediate child directory of the root is one provisioned volume whose
//! name is its [`IdentityKey`]. Sizes come from [`probe::measure`]. Only
//! opening the root is fatal; a child that cannot be read or measured is left
//! out of the snapshot rather than failing it.

use std::collections::HashMap;
use std::fs::DirEntry;
use std::io;
use std::path::{Path, PathBuf};

use crate::identity::IdentityKey;
use crate::probe::{self, ProbeError};

/// Used bytes per local volume for a single tick
pub type VolumeSizes = HashMap<IdentityKey, u64>;

/// Source of per-volume used bytes
pub trait VolumeInventory: Send + Sync {
    /// Measure every volume currently present.
    ///
    /// Only a failure to enumerate volumes at all is an error; individual
    /// volumes that cannot be measured are omitted.
    fn snapshot(&self) -> Result<VolumeSizes, InventoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to list volume root {}: {source}", .root.display())]
    ListRoot {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type ProbeFn = fn(&Path) -> Result<u64, ProbeError>;

/// Inventory backed by the provisioner's root directory on this node
#[derive(Debug, Clone)]
pub struct DirectoryInventory {
    root: PathBuf,
    probe: ProbeFn,
}

impl DirectoryInventory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            probe: probe::measure,
        }
    }

    #[cfg(test)]
    fn with_probe(root: impl Into<PathBuf>, probe: ProbeFn) -> Self {
        Self {
            root: root.into(),
            probe,
        }
    }

    /// Size of the volume behind one root entry, or `None` if it is skipped
    fn measure_entry(&self, entry: io::Result<DirEntry>) -> Option<(IdentityKey, u64)> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, root = %self.root.display(), "Failed to read volume root entry");
                return None;
            }
        };
        let path = entry.path();

        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {}
            Ok(_) => {
                tracing::debug!(path = %path.display(), "Skipping non-directory entry in volume root");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to stat volume entry");
                return None;
            }
        }

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                tracing::warn!(name = ?raw, "Skipping volume directory with non UTF-8 name");
                return None;
            }
        };

        match (self.probe)(&path) {
            Ok(bytes) => Some((IdentityKey::from_dir_name(name), bytes)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    volume = %name,
                    partial_bytes = e.partial_bytes,
                    "Failed to measure volume, omitting it from this tick"
                );
                None
            }
        }
    }
}

impl VolumeInventory for DirectoryInventory {
    fn snapshot(&self) -> Result<VolumeSizes, InventoryError> {
        let entries = std::fs::read_dir(&self.root).map_err(|source| InventoryError::ListRoot {
            root: self.root.clone(),
            source,
        })?;

        let sizes: VolumeSizes = entries.filter_map(|entry| self.measure_entry(entry)).collect();

        tracing::debug!(
            root = %self.root.display(),
            volumes = sizes.len(),
            "Measured local volumes"
        );

        Ok(sizes)
    }
}
