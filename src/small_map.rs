//! Small-map store — the hashed persistent map used below the migration
//! threshold, grounded in `original_source/src/pmemkv.h`'s `PmemKV` and
//! spec §4.6.
//!
//! Unlike the tree side, the small map doesn't live in the `PmemArena`; it
//! is a plain `HashMap` behind a `parking_lot::RwLock`, snapshotted to disk
//! through [`crate::persistence`]. The `write_valid`/`read_valid` flags and
//! `no_write_refs`/`no_read_refs` barriers are what let the state machine
//! drain in-flight operations before cutting over to the tree (spec §4.7's
//! `ChangeToComboTree_` sequence: flip `write_valid` false, spin on
//! `no_write_refs`, migrate, flip `read_valid` false, spin on
//! `no_read_refs`, drop the small map).

use crate::error::StoreError;
use crate::persistence::{self, PersistedData};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

pub struct SmallMapStore {
    path: PathBuf,
    map: RwLock<HashMap<u64, u64>>,
    write_valid: AtomicBool,
    read_valid: AtomicBool,
    write_refs: AtomicI64,
    read_refs: AtomicI64,
}

/// RAII guard incrementing a ref counter on acquire and decrementing on
/// drop, mirroring `PmemKV::WriteRef_`/`ReadRef_` in the original.
pub struct RefGuard<'a>(&'a AtomicI64);

impl Drop for RefGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl SmallMapStore {
    pub fn create(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            map: RwLock::new(HashMap::new()),
            write_valid: AtomicBool::new(true),
            read_valid: AtomicBool::new(true),
            write_refs: AtomicI64::new(0),
            read_refs: AtomicI64::new(0),
        }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::create(path));
        }
        let data: PersistedData<Vec<(u64, u64)>> = persistence::read_with_validation(path)?;
        let map: HashMap<u64, u64> = data.payload.into_iter().collect();
        Ok(Self {
            path: path.to_path_buf(),
            map: RwLock::new(map),
            write_valid: AtomicBool::new(true),
            read_valid: AtomicBool::new(true),
            write_refs: AtomicI64::new(0),
            read_refs: AtomicI64::new(0),
        })
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        let map = self.map.read();
        let mut payload: Vec<(u64, u64)> = map.iter().map(|(&k, &v)| (k, v)).collect();
        payload.sort_unstable_by_key(|p| p.0);
        let record_count = payload.len();
        persistence::write_with_integrity(
            &self.path,
            &PersistedData {
                payload,
                record_count,
            },
        )
    }

    pub fn is_write_valid(&self) -> bool {
        self.write_valid.load(Ordering::Acquire)
    }

    pub fn is_read_valid(&self) -> bool {
        self.read_valid.load(Ordering::Acquire)
    }

    pub fn disable_writes(&self) {
        self.write_valid.store(false, Ordering::Release);
    }

    pub fn disable_reads(&self) {
        self.read_valid.store(false, Ordering::Release);
    }

    pub fn acquire_write_ref(&self) -> RefGuard<'_> {
        self.write_refs.fetch_add(1, Ordering::AcqRel);
        RefGuard(&self.write_refs)
    }

    pub fn acquire_read_ref(&self) -> RefGuard<'_> {
        self.read_refs.fetch_add(1, Ordering::AcqRel);
        RefGuard(&self.read_refs)
    }

    /// Busy-spin until no in-flight writer holds a ref (spec §4.7's
    /// `NoWriteRef` barrier before migration begins moving data).
    pub fn wait_no_write_refs(&self) {
        while self.write_refs.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }

    /// Busy-spin until no in-flight reader holds a ref (the barrier
    /// before the small map's backing storage is torn down).
    pub fn wait_no_read_refs(&self) {
        while self.read_refs.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }

    /// `None` means `read_valid` was already false when the ref was
    /// acquired — the caller should retry against the tree instead.
    /// Acquiring the ref *before* checking the flag (rather than after)
    /// is what makes `wait_no_read_refs` a correct barrier: any reader
    /// that observed `read_valid == true` is guaranteed to be counted by
    /// the time it starts its lookup.
    pub fn get(&self, key: u64) -> Option<Option<u64>> {
        let _ref = self.acquire_read_ref();
        if !self.is_read_valid() {
            return None;
        }
        Some(self.map.read().get(&key).copied())
    }

    /// `None` means `write_valid` was already false — retry against the
    /// tree. See [`SmallMapStore::get`] for why the ref precedes the
    /// flag check.
    pub fn insert(&self, key: u64, value: u64) -> Option<bool> {
        let _ref = self.acquire_write_ref();
        if !self.is_write_valid() {
            return None;
        }
        Some(self.map.write().insert(key, value).is_none())
    }

    pub fn update(&self, key: u64, value: u64) -> Option<bool> {
        let _ref = self.acquire_write_ref();
        if !self.is_write_valid() {
            return None;
        }
        let mut map = self.map.write();
        Some(match map.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        })
    }

    pub fn delete(&self, key: u64) -> Option<Option<u64>> {
        let _ref = self.acquire_write_ref();
        if !self.is_write_valid() {
            return None;
        }
        Some(self.map.write().remove(&key))
    }

    pub fn size(&self) -> usize {
        self.map.read().len()
    }

    /// An ordered snapshot of all live pairs, used to seed the tree's
    /// bulk-build during migration (the original's `PmemKV::Iter`, which
    /// loads everything and sorts for a stable ordered view).
    pub fn snapshot_iter(&self) -> Vec<(u64, u64)> {
        let mut pairs: Vec<(u64, u64)> = self.map.read().iter().map(|(&k, &v)| (k, v)).collect();
        pairs.sort_unstable_by_key(|p| p.0);
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_get_update_delete() {
        let dir = tempdir().unwrap();
        let store = SmallMapStore::create(&dir.path().join("small.bin"));
        assert_eq!(store.insert(1, 100), Some(true));
        assert_eq!(store.insert(1, 200), Some(false)); // already present
        assert_eq!(store.get(1), Some(Some(100)));
        assert_eq!(store.update(1, 300), Some(true));
        assert_eq!(store.get(1), Some(Some(300)));
        assert_eq!(store.delete(1), Some(Some(300)));
        assert_eq!(store.get(1), Some(None));
        assert_eq!(store.update(1, 1), Some(false));
    }

    #[test]
    fn persist_and_reopen_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.bin");
        {
            let store = SmallMapStore::create(&path);
            store.insert(1, 10);
            store.insert(2, 20);
            store.persist().unwrap();
        }
        let reopened = SmallMapStore::open(&path).unwrap();
        assert_eq!(reopened.get(1), Some(Some(10)));
        assert_eq!(reopened.get(2), Some(Some(20)));
        assert_eq!(reopened.size(), 2);
    }

    #[test]
    fn snapshot_iter_is_sorted() {
        let dir = tempdir().unwrap();
        let store = SmallMapStore::create(&dir.path().join("small.bin"));
        for k in [5, 1, 3, 2, 4] {
            store.insert(k, k);
        }
        let snapshot = store.snapshot_iter();
        let keys: Vec<u64> = snapshot.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn write_valid_flag_gates_inserts_at_the_caller_level() {
        let dir = tempdir().unwrap();
        let store = SmallMapStore::create(&dir.path().join("small.bin"));
        assert!(store.is_write_valid());
        store.disable_writes();
        assert!(!store.is_write_valid());
        store.wait_no_write_refs(); // no outstanding refs, returns immediately
    }
}
