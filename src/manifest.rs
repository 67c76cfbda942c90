//! Manifest — a tiny persistent record pinning the store's on-disk layout,
//! grounded in `original_source/src/manifest.h` and spec §3/§4.7.
//!
//! The manifest is written transactionally *before* the state machine's
//! CAS that publishes a mode switch (spec §5: "manifest-before-CAS
//! durability"), so a crash between writing the manifest and flipping the
//! in-memory state word is recoverable — `open()` simply trusts whatever
//! the manifest says on disk.

use crate::error::StoreError;
use crate::persistence::{self, PersistedData};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestData {
    pub small_map_path: String,
    pub tree_pool_path: String,
    pub is_tree_mode: bool,
}

pub struct Manifest {
    path: PathBuf,
    data: ManifestData,
}

impl Manifest {
    pub fn create(path: &Path, small_map_path: &Path, tree_pool_path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            data: ManifestData {
                small_map_path: small_map_path.display().to_string(),
                tree_pool_path: tree_pool_path.display().to_string(),
                is_tree_mode: false,
            },
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let persisted: PersistedData<ManifestData> = persistence::read_with_validation(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            data: persisted.payload,
        })
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn is_tree_mode(&self) -> bool {
        self.data.is_tree_mode
    }

    pub fn small_map_path(&self) -> PathBuf {
        PathBuf::from(&self.data.small_map_path)
    }

    pub fn tree_pool_path(&self) -> PathBuf {
        PathBuf::from(&self.data.tree_pool_path)
    }

    /// Flip to tree mode and persist. Must happen before the in-memory
    /// state word's CAS to `UsingTree` (spec §5).
    pub fn set_tree_mode(&mut self, is_tree_mode: bool) -> Result<(), StoreError> {
        self.data.is_tree_mode = is_tree_mode;
        self.persist()
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        persistence::write_with_integrity(
            &self.path,
            &PersistedData {
                payload: self.data.clone(),
                record_count: 1,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_persist_reopen_round_trips() {
        let dir = tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.bin");
        let small = dir.path().join("small.bin");
        let tree = dir.path().join("tree.pool");

        {
            let mut m = Manifest::create(&manifest_path, &small, &tree);
            assert!(!m.is_tree_mode());
            m.set_tree_mode(true).unwrap();
        }

        let reopened = Manifest::open(&manifest_path).unwrap();
        assert!(reopened.is_tree_mode());
        assert_eq!(reopened.small_map_path(), small);
        assert_eq!(reopened.tree_pool_path(), tree);
    }
}
