//! B-layer — a dense, growable array of B-entries with per-slot locking,
//! grounded in `original_source/src/blevel.h`/`blevel.cc` and spec §4.4.
//!
//! Each slot is guarded by its own `parking_lot::RwLock` (the
//! linearization point for that slot's operations, spec §5); a single
//! global `Mutex` additionally serializes multi-slot structural surgery —
//! the merge helper that rebalances sub-entries between two adjacent
//! slots (spec §4.3) when one of them reports `Full`. Binary search runs
//! against an in-memory mirror of each slot's minimum routing key so a
//! lookup never has to take a slot lock just to compare keys.

use crate::bentry::BEntry;
use crate::error::Status;
use crate::pmem::PmemArena;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct BLevel {
    slots: Vec<RwLock<BEntry>>,
    /// Mirror of each slot's minimum routing key, kept in lockstep with
    /// `slots` under `structural` so binary search needs no slot lock.
    routing_keys: RwLock<Vec<u64>>,
    structural: Mutex<()>,
    expand_min_key: AtomicU64,
    expand_max_key: AtomicU64,
    /// Count of in-flight writers that have passed the `is_expanding`
    /// check, mirroring `small_map.rs`'s `write_refs`/`RefGuard` idiom.
    /// Acquired *before* the check so `wait_no_write_refs` is a correct
    /// barrier: any writer that observed `is_expanding() == false` is
    /// guaranteed to be counted by the time it starts its slot work.
    write_refs: AtomicI64,
}

const KEY_SENTINEL_MAX: u64 = u64::MAX;

/// RAII guard mirroring `small_map::RefGuard`.
struct WriteRefGuard<'a>(&'a AtomicI64);

impl Drop for WriteRefGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BLevel {
    /// Bulk-build from sorted, deduplicated pairs, grouping `group_size`
    /// consecutive pairs into each slot's B-entry (spread across that
    /// entry's up-to-4 sub-entries), mirroring the original's linear
    /// bulk-load during migration/expansion. `group_size` is clamped to
    /// `SUB_ENTRIES * CBUCKET_CAPACITY`, the most one B-entry can hold;
    /// a smaller `group_size` yields more, sparser slots with headroom
    /// to absorb further inserts before the next expansion.
    pub fn bulk_build(arena: &PmemArena, sorted_pairs: &[(u64, u64)], group_size: usize) -> Self {
        let group_size = group_size
            .max(1)
            .min(crate::bentry::SUB_ENTRIES * crate::cbucket::CBUCKET_CAPACITY);
        let mut slots = Vec::new();
        let mut routing_keys = Vec::new();
        for chunk in sorted_pairs.chunks(group_size) {
            let entry = BEntry::bulk_build_grouped(arena, chunk);
            routing_keys.push(entry.min_key().unwrap_or(chunk[0].0));
            slots.push(RwLock::new(entry));
        }
        if slots.is_empty() {
            slots.push(RwLock::new(BEntry::new()));
            routing_keys.push(0);
        }
        Self {
            slots,
            routing_keys: RwLock::new(routing_keys),
            structural: Mutex::new(()),
            expand_min_key: AtomicU64::new(KEY_SENTINEL_MAX),
            expand_max_key: AtomicU64::new(0),
            write_refs: AtomicI64::new(0),
        }
    }

    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    /// Greatest slot index whose routing key is `<= key`, preferring the
    /// A-layer's `[lo, hi)` candidate window (spec §4.4's `get(k, out v,
    /// lo, hi)` contract) over a full scan of the mirror. The window is
    /// only a hint: if it doesn't actually bracket `key` (stale after a
    /// merge shifted routing keys, or a PGM/RMI approximation miss) this
    /// falls back to a full binary search rather than risk a wrong slot.
    fn find_slot(&self, key: u64, hint: (usize, usize)) -> usize {
        let keys = self.routing_keys.read();
        let (lo, hi) = (hint.0.min(keys.len()), hint.1.min(keys.len()));
        if lo < hi {
            if let Some(i) = Self::binary_search_window(&keys, lo, hi, key) {
                return i;
            }
        }
        match keys.binary_search(&key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    /// Binary search restricted to `keys[lo..hi]`, returning `None` if the
    /// window doesn't bracket `key` on either side (the caller then falls
    /// back to searching the whole mirror).
    fn binary_search_window(keys: &[u64], lo: usize, hi: usize, key: u64) -> Option<usize> {
        if key < keys[lo] {
            return None;
        }
        match keys[lo..hi].binary_search(&key) {
            Ok(i) => Some(lo + i),
            Err(0) => None,
            Err(i) if lo + i == hi => None,
            Err(i) => Some(lo + i - 1),
        }
    }

    /// Increment the write-ref counter, mirroring
    /// `small_map::SmallMapStore::acquire_write_ref` — must be called
    /// before `is_expanding` is checked so a whole-layer expansion's
    /// `wait_no_write_refs` is a correct barrier.
    fn acquire_write_ref(&self) -> WriteRefGuard<'_> {
        self.write_refs.fetch_add(1, Ordering::AcqRel);
        WriteRefGuard(&self.write_refs)
    }

    /// `true` once a whole-layer expansion has published its in-flight
    /// range (spec §4.7), regardless of whether `key` falls inside it —
    /// expansion snapshots the entire B-layer, so every write must route
    /// around it, not just ones whose key happens to overlap.
    fn is_expanding(&self) -> bool {
        self.expand_min_key.load(Ordering::Acquire) != KEY_SENTINEL_MAX
    }

    /// Busy-spin until no writer is mid-operation (the barrier
    /// `run_expansion` waits on between marking the range and taking its
    /// snapshot, closing the lost-write window where a writer observed
    /// `is_expanding() == false` just before the flag flipped).
    pub fn wait_no_write_refs(&self) {
        while self.write_refs.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }

    pub fn get(&self, arena: &PmemArena, key: u64, hint: (usize, usize)) -> Option<u64> {
        let i = self.find_slot(key, hint);
        self.slots[i].read().get(arena, key)
    }

    /// Insert `key`/`value`. If the owning slot's B-entry is saturated
    /// (all 4 sub-entries in use and the one covering `key` also full),
    /// first try the merge helper (spec §4.3: "a put that arrived on a
    /// full entry but has an underfull neighbor is served by the merge
    /// helper before reporting `Full`"), which rebalances sub-entries
    /// with an adjacent slot to free room. Only if neither neighbor has
    /// spare capacity does `Full` reach the caller, which then must
    /// trigger a whole-B-layer expansion (spec §4.7) — this B-layer
    /// never grows by appending a slot in place.
    pub fn put(&self, arena: &PmemArena, key: u64, value: u64, hint: (usize, usize)) -> Status {
        let _ref = self.acquire_write_ref();
        if self.is_expanding() {
            return Status::Retry;
        }
        let i = self.find_slot(key, hint);
        // A sub-entry split on C-bucket overflow is contained entirely
        // within this slot's exclusive lock; the global `structural`
        // mutex is reserved for multi-slot operations (merge, expansion),
        // per spec §5.
        let status = {
            let mut entry = self.slots[i].write();
            entry.put(arena, key, value)
        };
        if status != Status::Full {
            return status;
        }
        if !self.try_merge_with_neighbor(i) {
            return Status::Full;
        }
        let i = self.find_slot(key, hint);
        self.slots[i].write().put(arena, key, value)
    }

    /// Redistribute sub-entries between slot `i` and an adjacent slot
    /// that isn't also saturated, freeing room in `i` without growing the
    /// B-layer. Returns `true` if a redistribution happened.
    fn try_merge_with_neighbor(&self, i: usize) -> bool {
        let _structural = self.structural.lock();
        let candidates = [
            i.checked_sub(1),
            (i + 1 < self.slots.len()).then_some(i + 1),
        ];
        for j in candidates.into_iter().flatten() {
            let (lo, hi) = if i < j { (i, j) } else { (j, i) };
            let mut low = self.slots[lo].write();
            let mut high = self.slots[hi].write();
            if low.used_count() + high.used_count() >= 2 * crate::bentry::SUB_ENTRIES {
                continue; // both saturated, nothing to redistribute
            }
            let mut combined = low.live_subs();
            combined.extend(high.live_subs());
            combined.sort_unstable_by_key(|p| p.0);
            let mid = combined.len() / 2;
            low.set_live_subs(&combined[..mid]);
            high.set_live_subs(&combined[mid..]);
            let low_key = low.min_key();
            let high_key = high.min_key();
            drop(low);
            drop(high);
            let mut keys = self.routing_keys.write();
            if let Some(k) = low_key {
                keys[lo] = k;
            }
            if let Some(k) = high_key {
                keys[hi] = k;
            }
            return true;
        }
        false
    }

    pub fn update(&self, arena: &PmemArena, key: u64, value: u64, hint: (usize, usize)) -> Status {
        let _ref = self.acquire_write_ref();
        if self.is_expanding() {
            return Status::Retry;
        }
        let i = self.find_slot(key, hint);
        self.slots[i].write().update(arena, key, value)
    }

    pub fn delete(&self, arena: &PmemArena, key: u64, hint: (usize, usize)) -> Result<u64, Status> {
        let _ref = self.acquire_write_ref();
        if self.is_expanding() {
            return Err(Status::Retry);
        }
        let i = self.find_slot(key, hint);
        self.slots[i].write().delete(arena, key)
    }

    /// Ordered scan starting at `start_key`, invoking `f` with each pair
    /// until it returns `false` or the B-layer is exhausted. Per spec
    /// Open Question (c), callers restart a scan using the last key `f`
    /// was called with, not a caller-owned buffer.
    pub fn scan<F: FnMut(u64, u64) -> bool>(
        &self,
        arena: &PmemArena,
        start_key: u64,
        hint: (usize, usize),
        mut f: F,
    ) {
        let start = self.find_slot(start_key, hint);
        for i in start..self.slots.len() {
            let entry = self.slots[i].read();
            let mut pairs: Vec<(u64, u64)> = entry.iter(arena).collect();
            pairs.sort_unstable_by_key(|p| p.0);
            for (k, v) in pairs {
                if k < start_key {
                    continue;
                }
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    pub fn min_entry_key(&self) -> Option<u64> {
        self.routing_keys.read().first().copied()
    }

    pub fn max_entry_key(&self) -> Option<u64> {
        self.routing_keys.read().last().copied()
    }

    /// Mark `[min_key, max_key]`'s slots under active expansion so
    /// concurrent readers/writers can tell whether to consult the old or
    /// new B-layer (spec §4.4/§4.7).
    pub fn begin_expansion_range(&self, min_key: u64, max_key: u64) {
        self.expand_min_key.store(min_key, Ordering::Release);
        self.expand_max_key.store(max_key, Ordering::Release);
    }

    pub fn expansion_range(&self) -> (u64, u64) {
        (
            self.expand_min_key.load(Ordering::Acquire),
            self.expand_max_key.load(Ordering::Acquire),
        )
    }

    pub fn clear_expansion_range(&self) {
        self.expand_min_key.store(KEY_SENTINEL_MAX, Ordering::Release);
        self.expand_max_key.store(0, Ordering::Release);
    }

    /// Snapshot all live pairs in ascending key order (used to bulk-build
    /// the expanded B-layer).
    pub fn snapshot_sorted(&self, arena: &PmemArena) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        for slot in &self.slots {
            out.extend(slot.read().iter(arena));
        }
        out.sort_unstable_by_key(|p| p.0);
        out
    }

    /// Invalidate every slot's sub-entries in place (the source B-layer,
    /// once expansion's bulk-build of the destination has completed and
    /// been swapped in, is dropped — but a reader holding a stale
    /// `Arc<BLevel>` mid-transition must see `None` rather than stale
    /// data for any key already migrated).
    pub fn invalidate_all(&self) {
        for slot in &self.slots {
            slot.write().invalidate_all();
        }
    }

    /// Serializes the decision to trigger expansion: only one thread
    /// should observe "this B-layer is full" and act on it. Held only
    /// for the duration of that check, never across the bulk-rebuild
    /// itself (spec §5: suspension points must not hold this lock).
    pub fn lock_structural(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.structural.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_arena() -> PmemArena {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena");
        std::mem::forget(dir);
        PmemArena::open(&path, 4 << 20).unwrap()
    }

    fn build(arena: &PmemArena, n: u64) -> BLevel {
        let pairs: Vec<(u64, u64)> = (0..n).map(|k| (k, k * 10)).collect();
        BLevel::bulk_build(arena, &pairs, 8)
    }

    /// A permissive hint spanning the whole mirror, for tests exercising
    /// slot logic rather than the A-layer's range-narrowing itself.
    fn whole(bl: &BLevel) -> (usize, usize) {
        (0, bl.entries())
    }

    #[test]
    fn get_finds_every_bulk_loaded_key() {
        let arena = test_arena();
        let bl = build(&arena, 200);
        let hint = whole(&bl);
        for k in 0..200u64 {
            assert_eq!(bl.get(&arena, k, hint), Some(k * 10));
        }
        assert_eq!(bl.get(&arena, 99999, hint), None);
    }

    #[test]
    fn put_update_delete_roundtrip() {
        let arena = test_arena();
        let bl = build(&arena, 50);
        let hint = whole(&bl);
        assert_eq!(bl.update(&arena, 10, 999, hint), Status::Ok);
        assert_eq!(bl.get(&arena, 10, hint), Some(999));
        assert_eq!(bl.delete(&arena, 10, hint), Ok(999));
        assert_eq!(bl.get(&arena, 10, hint), None);
        assert_eq!(bl.update(&arena, 10, 1, hint), Status::NotFound);
    }

    #[test]
    fn find_slot_falls_back_when_hint_misses() {
        let arena = test_arena();
        let bl = build(&arena, 200);
        // A hint window nowhere near key 150's true slot must not produce
        // a wrong answer — it should fall back to the full mirror search.
        assert_eq!(bl.get(&arena, 150, (0, 1)), Some(1500));
    }

    #[test]
    fn scan_yields_ascending_order_from_start_key() {
        let arena = test_arena();
        let bl = build(&arena, 100);
        let hint = whole(&bl);
        let mut seen = Vec::new();
        bl.scan(&arena, 50, hint, |k, v| {
            seen.push((k, v));
            seen.len() < 10
        });
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(seen[0].0, 50);
    }

    #[test]
    fn bulk_build_packs_multiple_sub_entries_per_group() {
        let arena = test_arena();
        // group_size=60 == SUB_ENTRIES * CBUCKET_CAPACITY: 60 keys pack
        // into one slot's B-entry across all 4 sub-entries.
        let pairs: Vec<(u64, u64)> = (0..60u64).map(|k| (k, k)).collect();
        let bl = BLevel::bulk_build(&arena, &pairs, 60);
        assert_eq!(bl.entries(), 1);
        let hint = whole(&bl);
        for k in 0..60u64 {
            assert_eq!(bl.get(&arena, k, hint), Some(k));
        }
    }

    #[test]
    fn put_on_saturated_entry_merges_with_neighbor_instead_of_full() {
        let arena = test_arena();
        // 60 even keys exactly saturate slot 0's B-entry (4 sub-entries x
        // 15 keys each, no gaps within any single sub-entry's bucket);
        // 10 keys in slot 1 leave it with spare sub-entry room.
        let mut pairs: Vec<(u64, u64)> = (0..60u64).map(|i| (i * 2, i)).collect();
        pairs.extend((0..10u64).map(|i| (120 + i, i)));
        let bl = BLevel::bulk_build(&arena, &pairs, 60);
        assert_eq!(bl.entries(), 2);
        let hint = whole(&bl);

        // key 1 falls within slot 0's range but isn't present, and slot
        // 0's B-entry has no free sub-entry or bucket room of its own —
        // this must be served by the merge helper, not `Full`.
        assert_eq!(bl.put(&arena, 1, 999, hint), Status::Ok);
        assert_eq!(bl.get(&arena, 1, hint), Some(999));
        for (k, v) in &pairs {
            assert_eq!(bl.get(&arena, *k, hint), Some(*v));
        }
    }

    #[test]
    fn put_returns_retry_while_expansion_is_marked() {
        let arena = test_arena();
        let bl = build(&arena, 20);
        let hint = whole(&bl);
        bl.begin_expansion_range(0, u64::MAX);
        assert_eq!(bl.put(&arena, 1000, 1, hint), Status::Retry);
        assert_eq!(bl.update(&arena, 5, 1, hint), Status::Retry);
        assert_eq!(bl.delete(&arena, 5, hint), Err(Status::Retry));
        bl.clear_expansion_range();
        assert_eq!(bl.put(&arena, 1000, 1, hint), Status::Ok);
    }

    #[test]
    fn expansion_range_round_trips() {
        let arena = test_arena();
        let bl = build(&arena, 10);
        bl.begin_expansion_range(5, 20);
        assert_eq!(bl.expansion_range(), (5, 20));
        bl.clear_expansion_range();
        assert_eq!(bl.expansion_range(), (KEY_SENTINEL_MAX, 0));
    }
}
