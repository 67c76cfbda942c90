//! # combo-kv
//!
//! A hybrid, persistent-memory-backed ordered key-value index for `u64`
//! keys. Below a configurable size threshold, keys live in a plain hashed
//! map; once the threshold is crossed, the store migrates online to a
//! multi-level learned-index-routed tree (an A-layer router narrowing a
//! key to a candidate range, a B-layer of packed entries, C-buckets of
//! sorted leaf pairs) and keeps growing that tree in place via expansion.
//!
//! ## Example
//!
//! ```rust
//! use combo_kv::{Store, StoreConfig};
//!
//! # fn main() -> combo_kv::StoreResult<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let store = Store::open(StoreConfig::new(dir.path()))?;
//!
//! store.insert(1, 100)?;
//! store.insert(2, 200)?;
//! assert_eq!(store.get(1), Some(100));
//!
//! let seen = store.scan(0, u64::MAX, u64::MAX);
//! assert_eq!(seen, vec![(1, 100), (2, 200)]);
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! Multi-key transactions, range deletes, variable-length keys/values,
//! crash recovery beyond single-operation durability, and cross-process
//! sharing are all out of scope — see `DESIGN.md` for the reasoning.

// Everything below `error` and `store` is an internal implementation
// detail: the A-layer, B-layer, B-entry, C-bucket, PMem arena, small map
// and manifest are all assembled into the single public `Store` type.
mod alevel;
mod bentry;
mod blevel;
mod cbucket;
mod error;
mod manifest;
mod pmem;
mod small_map;
mod store;
mod persistence;

pub use error::{StoreError, StoreResult};
pub use store::{Store, StoreConfig, DEFAULT_EXPANSION_FACTOR, DEFAULT_MIGRATION_THRESHOLD};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_insert_get_close_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(StoreConfig::new(dir.path())).unwrap();
            store.insert(1, 10).unwrap();
            store.insert(2, 20).unwrap();
            store.close().unwrap();
        }
        let reopened = Store::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(reopened.get(1), Some(10));
        assert_eq!(reopened.get(2), Some(20));
    }

    #[test]
    fn delete_of_missing_key_returns_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.delete(42).unwrap(), None);
    }
}
