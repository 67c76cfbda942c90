use combo_kv::{Store, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::tempdir;

fn store_with_size(size: u64, threshold: usize) -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(
        StoreConfig::new(dir.path())
            .pool_size(64 << 20)
            .migration_threshold(threshold),
    )
    .unwrap();
    for k in 0..size {
        store.insert(k, k.wrapping_mul(0x9e3779b9)).unwrap();
    }
    for _ in 0..500 {
        if store.size() as u64 == size {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
    (dir, store)
}

fn bench_lookup_small_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_small_map");
    for size in [64, 256, 900].iter() {
        // threshold above dataset size keeps these runs in UsingSmall mode
        let (_dir, store) = store_with_size(*size as u64, 10_000);
        group.bench_with_input(BenchmarkId::new("get", size), size, |b, &size| {
            let mut k = 0u64;
            b.iter(|| {
                let result = store.get(black_box(k % size as u64));
                k = k.wrapping_add(1);
                black_box(result)
            })
        });
    }
    group.finish();
}

fn bench_lookup_tree_mode(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_tree_mode");
    for size in [1_000, 10_000, 50_000].iter() {
        let (_dir, store) = store_with_size(*size as u64, 64);
        group.bench_with_input(BenchmarkId::new("get", size), size, |b, &size| {
            let mut k = 0u64;
            b.iter(|| {
                let result = store.get(black_box(k % size as u64));
                k = k.wrapping_add(1);
                black_box(result)
            })
        });
    }
    group.finish();
}

fn bench_insert_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_throughput");
    for size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("insert", size), size, |b, &size| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                let store =
                    Store::open(StoreConfig::new(dir.path()).pool_size(64 << 20)).unwrap();
                for k in 0..size {
                    black_box(store.insert(k as u64, k as u64).unwrap());
                }
            })
        });
    }
    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    for size in [1_000, 10_000].iter() {
        let (_dir, store) = store_with_size(*size as u64, 64);
        group.bench_with_input(BenchmarkId::new("range_100", size), size, |b, &size| {
            b.iter(|| black_box(store.scan(0, size as u64 / 2, 100)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_lookup_small_map,
    bench_lookup_tree_mode,
    bench_insert_throughput,
    bench_scan
);
criterion_main!(benches);
