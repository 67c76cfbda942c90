//! The public embedding API and the dual-mode state machine, grounded in
//! `original_source/src/combotree.cc` and spec §4.7/§5/§6.
//!
//! `Store` is a cheap `Arc`-backed handle (clone it to share across
//! threads). Internally it holds four states
//! (`UsingSmall`/`MigratingToTree`/`UsingTree`/`TreeExpanding`) in an
//! `AtomicU8`; `insert`/`update`/`get`/`delete` retry-loop on that word the
//! same way `combotree.cc`'s operations do, routing to the small map or
//! the tree depending on what they observe. Migration and expansion run on
//! owned background threads (a [`BackgroundTask`]) rather than the
//! original's detached `std::thread`, so `close()` can always join them
//! before the process exits.

use crate::alevel::{
    Router, RouterVariant, DEFAULT_CDF_BUCKETS, DEFAULT_PGM_EPSILON, DEFAULT_RMI_LEAVES,
};
use crate::blevel::BLevel;
use crate::error::{StoreError, StoreResult};
use crate::manifest::Manifest;
use crate::pmem::PmemArena;
use crate::small_map::SmallMapStore;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

const STATE_USING_SMALL: u8 = 0;
const STATE_MIGRATING_TO_TREE: u8 = 1;
const STATE_USING_TREE: u8 = 2;
const STATE_TREE_EXPANDING: u8 = 3;

/// Default small-map-to-tree migration threshold, mirroring the
/// original's `PMEMKV_THRESHOLD`.
pub const DEFAULT_MIGRATION_THRESHOLD: usize = 1024;
/// Default growth factor applied to entry count on each expansion,
/// mirroring the original's `EXPANSION_FACTOR`.
pub const DEFAULT_EXPANSION_FACTOR: f64 = 1.5;
const DEFAULT_POOL_SIZE: u64 = 64 << 20;
const DEFAULT_GROUP_SIZE: usize = 12;

/// Tunable parameters, the idiomatic-Rust substitute for the original's
/// compiled-in `combotree_config.h` constants (SPEC_FULL.md §1).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub pool_dir: PathBuf,
    pub pool_size: u64,
    pub migration_threshold: usize,
    pub expansion_factor: f64,
    pub cdf_buckets: usize,
    /// Build-time A-layer model choice (SPEC_FULL.md §4.5).
    pub a_layer: RouterVariant,
    pub pgm_epsilon: u32,
    pub rmi_leaves: usize,
    pub create: bool,
}

impl StoreConfig {
    pub fn new(pool_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool_dir: pool_dir.into(),
            pool_size: DEFAULT_POOL_SIZE,
            migration_threshold: DEFAULT_MIGRATION_THRESHOLD,
            expansion_factor: DEFAULT_EXPANSION_FACTOR,
            cdf_buckets: DEFAULT_CDF_BUCKETS,
            a_layer: RouterVariant::Cdf,
            pgm_epsilon: DEFAULT_PGM_EPSILON,
            rmi_leaves: DEFAULT_RMI_LEAVES,
            create: true,
        }
    }

    pub fn pool_size(mut self, bytes: u64) -> Self {
        self.pool_size = bytes;
        self
    }

    pub fn migration_threshold(mut self, n: usize) -> Self {
        self.migration_threshold = n;
        self
    }

    pub fn expansion_factor(mut self, f: f64) -> Self {
        self.expansion_factor = f;
        self
    }

    pub fn cdf_buckets(mut self, n: usize) -> Self {
        self.cdf_buckets = n;
        self
    }

    pub fn a_layer(mut self, variant: RouterVariant) -> Self {
        self.a_layer = variant;
        self
    }

    pub fn pgm_epsilon(mut self, epsilon: u32) -> Self {
        self.pgm_epsilon = epsilon;
        self
    }

    pub fn rmi_leaves(mut self, n: usize) -> Self {
        self.rmi_leaves = n;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    fn build_router(&self, sorted_keys: &[u64]) -> Router {
        Router::build(
            self.a_layer,
            sorted_keys,
            self.cdf_buckets,
            self.pgm_epsilon,
            self.rmi_leaves,
        )
    }

    fn manifest_path(&self) -> PathBuf {
        self.pool_dir.join("manifest.bin")
    }

    fn small_map_path(&self) -> PathBuf {
        self.pool_dir.join("pmemkv.bin")
    }

    fn tree_pool_path(&self) -> PathBuf {
        self.pool_dir.join("tree-pool")
    }

    fn tree_snapshot_path(&self) -> PathBuf {
        self.pool_dir.join("tree-snapshot.bin")
    }
}

struct TreeView {
    router: Router,
    blevel: BLevel,
}

/// Owned-handle replacement for the original's detached migration/
/// expansion threads (SPEC_FULL.md §4.7 supplemental).
#[derive(Default)]
struct BackgroundTask {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::spawn(f);
        *self.handle.lock() = Some(handle);
    }

    fn join_on_close(&self) {
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }
}

struct Inner {
    config: StoreConfig,
    state: AtomicU8,
    small_map: Mutex<Option<SmallMapStore>>,
    arena: PmemArena,
    tree: ArcSwapOption<TreeView>,
    manifest: Mutex<Manifest>,
    background: BackgroundTask,
}

/// A cheaply-cloneable handle to an open store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        if config.pool_dir.exists() && !config.pool_dir.is_dir() {
            return Err(StoreError::InvalidPoolDir(
                config.pool_dir.display().to_string(),
            ));
        }
        let manifest_path = config.manifest_path();
        let fresh = !Manifest::exists(&manifest_path);
        if fresh && !config.create {
            return Err(StoreError::PoolMissing(config.pool_dir.display().to_string()));
        }
        std::fs::create_dir_all(&config.pool_dir)?;

        let arena = PmemArena::open(&config.tree_pool_path(), config.pool_size)?;

        let (manifest, state, small_map, tree) = if fresh {
            log::info!("store: creating fresh pool at {:?}", config.pool_dir);
            let manifest = Manifest::create(
                &manifest_path,
                &config.small_map_path(),
                &config.tree_pool_path(),
            );
            manifest.persist()?;
            let small_map = SmallMapStore::create(&config.small_map_path());
            (manifest, STATE_USING_SMALL, Some(small_map), None)
        } else {
            log::info!("store: opening existing pool at {:?}", config.pool_dir);
            let manifest = Manifest::open(&manifest_path)?;
            if manifest.is_tree_mode() {
                let view = Self::load_tree_snapshot(&arena, &config)?;
                (manifest, STATE_USING_TREE, None, Some(Arc::new(view)))
            } else {
                let small_map = SmallMapStore::open(&config.small_map_path())?;
                (manifest, STATE_USING_SMALL, Some(small_map), None)
            }
        };

        Ok(Store {
            inner: Arc::new(Inner {
                config,
                state: AtomicU8::new(state),
                small_map: Mutex::new(small_map),
                arena,
                tree: ArcSwapOption::from(tree),
                manifest: Mutex::new(manifest),
                background: BackgroundTask::default(),
            }),
        })
    }

    fn load_tree_snapshot(arena: &PmemArena, config: &StoreConfig) -> StoreResult<TreeView> {
        use crate::persistence::{self, PersistedData};
        let snapshot_path = config.tree_snapshot_path();
        let data: PersistedData<Vec<(u64, u64)>> =
            persistence::read_with_validation(&snapshot_path)?;
        let pairs = data.payload;
        let keys: Vec<u64> = pairs.iter().map(|p| p.0).collect();
        let router = config.build_router(&keys);
        let blevel = BLevel::bulk_build(arena, &pairs, DEFAULT_GROUP_SIZE);
        Ok(TreeView { router, blevel })
    }

    fn state(&self) -> u8 {
        self.inner.state.load(Ordering::Acquire)
    }

    pub fn insert(&self, key: u64, value: u64) -> StoreResult<bool> {
        loop {
            match self.state() {
                STATE_USING_SMALL => {
                    let guard = self.inner.small_map.lock();
                    let small = match guard.as_ref() {
                        Some(s) => s,
                        None => continue,
                    };
                    let inserted = match small.insert(key, value) {
                        Some(r) => r,
                        None => {
                            drop(guard);
                            std::hint::spin_loop();
                            continue;
                        }
                    };
                    let size = small.size();
                    drop(guard);
                    if inserted && size >= self.inner.config.migration_threshold {
                        self.maybe_start_migration();
                    }
                    return Ok(inserted);
                }
                STATE_MIGRATING_TO_TREE => {
                    std::hint::spin_loop();
                    continue;
                }
                STATE_USING_TREE => {
                    let view = self.inner.tree.load();
                    let view = match view.as_ref() {
                        Some(v) => v,
                        None => continue,
                    };
                    let hint = view.router.locate(key, view.blevel.entries());
                    let status = view.blevel.put(&self.inner.arena, key, value, hint);
                    match status {
                        crate::error::Status::Ok => return Ok(true),
                        crate::error::Status::AlreadyExists => return Ok(false),
                        crate::error::Status::Full => {
                            self.maybe_start_expansion();
                            continue;
                        }
                        crate::error::Status::Retry => {
                            std::hint::spin_loop();
                            continue;
                        }
                        _ => continue,
                    }
                }
                STATE_TREE_EXPANDING => {
                    std::hint::spin_loop();
                    continue;
                }
                _ => unreachable!("invalid state word"),
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        loop {
            match self.state() {
                STATE_USING_SMALL => {
                    let guard = self.inner.small_map.lock();
                    let small = match guard.as_ref() {
                        Some(s) => s,
                        None => continue,
                    };
                    match small.get(key) {
                        Some(result) => return result,
                        None => {
                            drop(guard);
                            std::hint::spin_loop();
                            continue;
                        }
                    }
                }
                STATE_MIGRATING_TO_TREE => {
                    // Reads are still served from the small map until it
                    // flips `read_valid` false right before teardown.
                    let guard = self.inner.small_map.lock();
                    if let Some(small) = guard.as_ref() {
                        if let Some(result) = small.get(key) {
                            return result;
                        }
                    }
                    drop(guard);
                    let view = self.inner.tree.load();
                    if let Some(v) = view.as_ref() {
                        let hint = v.router.locate(key, v.blevel.entries());
                        return v.blevel.get(&self.inner.arena, key, hint);
                    }
                    std::hint::spin_loop();
                    continue;
                }
                STATE_USING_TREE | STATE_TREE_EXPANDING => {
                    let view = self.inner.tree.load();
                    match view.as_ref() {
                        Some(v) => {
                            let hint = v.router.locate(key, v.blevel.entries());
                            return v.blevel.get(&self.inner.arena, key, hint);
                        }
                        None => continue,
                    }
                }
                _ => unreachable!("invalid state word"),
            }
        }
    }

    pub fn update(&self, key: u64, value: u64) -> StoreResult<bool> {
        loop {
            match self.state() {
                STATE_USING_SMALL => {
                    let guard = self.inner.small_map.lock();
                    let small = match guard.as_ref() {
                        Some(s) => s,
                        None => continue,
                    };
                    match small.update(key, value) {
                        Some(r) => return Ok(r),
                        None => {
                            drop(guard);
                            std::hint::spin_loop();
                            continue;
                        }
                    }
                }
                STATE_MIGRATING_TO_TREE => {
                    std::hint::spin_loop();
                    continue;
                }
                STATE_USING_TREE => {
                    let view = self.inner.tree.load();
                    match view.as_ref() {
                        Some(v) => {
                            let hint = v.router.locate(key, v.blevel.entries());
                            match v.blevel.update(&self.inner.arena, key, value, hint) {
                                crate::error::Status::Ok => return Ok(true),
                                crate::error::Status::NotFound => return Ok(false),
                                crate::error::Status::Retry => {
                                    std::hint::spin_loop();
                                    continue;
                                }
                                _ => continue,
                            }
                        }
                        None => continue,
                    }
                }
                STATE_TREE_EXPANDING => {
                    std::hint::spin_loop();
                    continue;
                }
                _ => unreachable!("invalid state word"),
            }
        }
    }

    pub fn delete(&self, key: u64) -> StoreResult<Option<u64>> {
        loop {
            match self.state() {
                STATE_USING_SMALL => {
                    let guard = self.inner.small_map.lock();
                    let small = match guard.as_ref() {
                        Some(s) => s,
                        None => continue,
                    };
                    match small.delete(key) {
                        Some(r) => return Ok(r),
                        None => {
                            drop(guard);
                            std::hint::spin_loop();
                            continue;
                        }
                    }
                }
                STATE_MIGRATING_TO_TREE => {
                    std::hint::spin_loop();
                    continue;
                }
                STATE_USING_TREE => {
                    let view = self.inner.tree.load();
                    match view.as_ref() {
                        Some(v) => {
                            let hint = v.router.locate(key, v.blevel.entries());
                            match v.blevel.delete(&self.inner.arena, key, hint) {
                                Ok(value) => return Ok(Some(value)),
                                Err(crate::error::Status::Retry) => {
                                    std::hint::spin_loop();
                                    continue;
                                }
                                Err(_) => return Ok(None),
                            }
                        }
                        None => continue,
                    }
                }
                STATE_TREE_EXPANDING => {
                    std::hint::spin_loop();
                    continue;
                }
                _ => unreachable!("invalid state word"),
            }
        }
    }

    /// Drives an ordered walk starting at `start_key`, invoking `f` with
    /// each pair until it returns `false` or the store is exhausted. To
    /// resume later, restart from the last key passed to `f` (spec Open
    /// Question (c) — never from a caller-owned buffer's stale contents).
    fn scan_from<F: FnMut(u64, u64) -> bool>(&self, start_key: u64, mut f: F) {
        match self.state() {
            STATE_USING_SMALL | STATE_MIGRATING_TO_TREE => {
                let guard = self.inner.small_map.lock();
                if let Some(small) = guard.as_ref() {
                    for (k, v) in small.snapshot_iter() {
                        if k < start_key {
                            continue;
                        }
                        if !f(k, v) {
                            return;
                        }
                    }
                }
            }
            _ => {
                let view = self.inner.tree.load();
                if let Some(v) = view.as_ref() {
                    let hint = v.router.locate(start_key, v.blevel.entries());
                    v.blevel.scan(&self.inner.arena, start_key, hint, f);
                }
            }
        }
    }

    /// Ordered range scan: every `(k, v)` with `min_k <= k <= max_k`, up
    /// to `cap` pairs. Pass `cap = u64::MAX` to mean "until `max_k` is
    /// exhausted" (spec §6) — the walk still terminates because the
    /// underlying store is finite.
    pub fn scan(&self, min_k: u64, max_k: u64, cap: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        self.scan_from(min_k, |k, v| {
            if k > max_k || out.len() as u64 >= cap {
                return false;
            }
            out.push((k, v));
            (out.len() as u64) < cap
        });
        out
    }

    pub fn size(&self) -> usize {
        match self.state() {
            STATE_USING_SMALL | STATE_MIGRATING_TO_TREE => self
                .inner
                .small_map
                .lock()
                .as_ref()
                .map(SmallMapStore::size)
                .unwrap_or(0),
            _ => {
                let view = self.inner.tree.load();
                view.as_ref()
                    .map(|v| v.blevel.snapshot_sorted(&self.inner.arena).len())
                    .unwrap_or(0)
            }
        }
    }

    /// An ordered cursor over the store's entire current contents (spec
    /// §6's `iterator(h)`).
    pub fn iterator(&self) -> std::vec::IntoIter<(u64, u64)> {
        let mut out = Vec::new();
        self.scan_from(0, |k, v| {
            out.push((k, v));
            true
        });
        out.into_iter()
    }

    fn maybe_start_migration(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_USING_SMALL,
                STATE_MIGRATING_TO_TREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        log::info!("state machine: UsingSmall -> MigratingToTree");
        let inner = self.inner.clone();
        self.inner.background.spawn(move || Self::run_migration(inner));
    }

    fn run_migration(inner: Arc<Inner>) {
        let guard = inner.small_map.lock();
        let small = guard.as_ref().expect("small map present during migration");
        small.disable_writes();
        small.wait_no_write_refs();
        let pairs = small.snapshot_iter();
        drop(guard);

        let keys: Vec<u64> = pairs.iter().map(|p| p.0).collect();
        let router = inner.config.build_router(&keys);
        let blevel = BLevel::bulk_build(&inner.arena, &pairs, DEFAULT_GROUP_SIZE);
        inner.tree.store(Some(Arc::new(TreeView { router, blevel })));

        {
            let mut manifest = inner.manifest.lock();
            if let Err(e) = manifest.set_tree_mode(true) {
                log::warn!("migration: failed to persist manifest: {e}");
            }
        }
        inner.state.store(STATE_USING_TREE, Ordering::Release);
        log::info!("state machine: MigratingToTree -> UsingTree");

        let guard = inner.small_map.lock();
        if let Some(small) = guard.as_ref() {
            small.disable_reads();
            small.wait_no_read_refs();
        }
        drop(guard);
        *inner.small_map.lock() = None;
        let _ = std::fs::remove_file(inner.config.small_map_path());
    }

    fn maybe_start_expansion(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_USING_TREE,
                STATE_TREE_EXPANDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        log::info!("state machine: UsingTree -> TreeExpanding");
        let inner = self.inner.clone();
        self.inner.background.spawn(move || Self::run_expansion(inner));
    }

    fn run_expansion(inner: Arc<Inner>) {
        let old_view = inner.tree.load_full().expect("tree present during expansion");
        // Mark the entire key space in flight *before* taking the
        // snapshot, then drain any writer that passed the
        // `STATE_USING_TREE` check and acquired a slot lock before this
        // thread's CAS to `TreeExpanding` landed. Without this order a
        // writer could still commit a `put` into a slot after
        // `snapshot_sorted` has already read it, and that write would be
        // silently dropped when `invalidate_all` tears down the old
        // B-layer below.
        old_view.blevel.begin_expansion_range(0, u64::MAX);
        old_view.blevel.wait_no_write_refs();
        let pairs = old_view.blevel.snapshot_sorted(&inner.arena);

        let new_group_size =
            ((DEFAULT_GROUP_SIZE as f64) / inner.config.expansion_factor).max(1.0) as usize;
        let keys: Vec<u64> = pairs.iter().map(|p| p.0).collect();
        let router = inner.config.build_router(&keys);
        let blevel = BLevel::bulk_build(&inner.arena, &pairs, new_group_size);
        inner.tree.store(Some(Arc::new(TreeView { router, blevel })));

        old_view.blevel.invalidate_all();
        old_view.blevel.clear_expansion_range();
        inner.state.store(STATE_USING_TREE, Ordering::Release);
        log::info!("state machine: TreeExpanding -> UsingTree");
    }

    /// Join any in-flight background migration/expansion and persist a
    /// snapshot of whatever the store currently holds. Safe to call more
    /// than once.
    pub fn close(&self) -> StoreResult<()> {
        self.inner.background.join_on_close();
        match self.state() {
            STATE_USING_SMALL => {
                if let Some(small) = self.inner.small_map.lock().as_ref() {
                    small.persist()?;
                }
            }
            _ => {
                let view = self.inner.tree.load();
                if let Some(v) = view.as_ref() {
                    use crate::persistence::{self, PersistedData};
                    let pairs = v.blevel.snapshot_sorted(&self.inner.arena);
                    let record_count = pairs.len();
                    persistence::write_with_integrity(
                        &self.inner.config.tree_snapshot_path(),
                        &PersistedData {
                            payload: pairs,
                            record_count,
                        },
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn pool_dir(&self) -> &Path {
        &self.inner.config.pool_dir
    }
}
