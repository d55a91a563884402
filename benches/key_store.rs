//! Key store benchmarks
//!
//! The key store sits on every I/O of a validation run, so its per-block
//! operations must stay far below device latency.
//!
//! | Operation            | Expectation        | Notes                         |
//! |----------------------|--------------------|-------------------------------|
//! | get / set            | tens of ns         | one atomic byte               |
//! | busy acquire/release | tens of ns         | CAS loop, uncontended         |
//! | busy sweep           | memory bandwidth   | full scan at startup          |
//! | sector compare       | well under 1 µs    | header parse + pattern fill   |
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench key_store
//! ```

use blockdv::engine::{build_block, compare_sectors};
use blockdv::{BlockKey, DeviceName, KeyStore, SegmentLayout, StoreOptions, XxhPattern};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

fn open_store(dir: &TempDir, blocks: u64) -> KeyStore {
    let options = StoreOptions::new().layout(SegmentLayout::new(20).unwrap());
    KeyStore::open(dir.path(), "bench", blocks, options).unwrap()
}

// =============================================================================
// Per-block operations
// =============================================================================

fn point_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_store_point");
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 1 << 22);

    group.throughput(Throughput::Elements(1));

    group.bench_function("get", |b| {
        let mut block = 0u64;
        b.iter(|| {
            block = (block + 7919) & ((1 << 22) - 1);
            black_box(store.get(black_box(block)).unwrap())
        });
    });

    group.bench_function("set", |b| {
        let mut block = 0u64;
        b.iter(|| {
            block = (block + 7919) & ((1 << 22) - 1);
            store.set(block, BlockKey::new(5), false).unwrap();
        });
    });

    group.bench_function("acquire_confirm", |b| {
        let mut block = 0u64;
        b.iter(|| {
            block = (block + 7919) & ((1 << 22) - 1);
            black_box(store.get_key_and_set_busy(block).unwrap());
            store.confirm(block, BlockKey::new(6)).unwrap();
        });
    });

    group.finish();
}

// =============================================================================
// Startup sweep
// =============================================================================

fn sweep_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_store_sweep");
    group.sample_size(20);

    for blocks in [1u64 << 16, 1 << 20, 1 << 23] {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, blocks);
        for block in (0..blocks).step_by(64) {
            store.set(block, BlockKey::new(3), block % 128 == 0).unwrap();
        }

        group.throughput(Throughput::Elements(blocks));
        group.bench_with_input(BenchmarkId::new("census", blocks), &store, |b, store| {
            b.iter(|| black_box(store.census()));
        });
        group.bench_with_input(BenchmarkId::new("clear_busy", blocks), &store, |b, store| {
            b.iter(|| black_box(store.sweep_clear_busy().unwrap()));
        });
    }

    group.finish();
}

// =============================================================================
// Sector comparison
// =============================================================================

fn compare_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("compare");
    let name = DeviceName::from_name("bench");

    for kbs in [512u32, 4096, 65536] {
        let data = build_block(&XxhPattern, 0, &[BlockKey::new(9)], kbs, name, 1, 1).unwrap();
        group.throughput(Throughput::Bytes(kbs as u64));
        group.bench_with_input(BenchmarkId::new("clean_key_block", kbs), &data, |b, data| {
            b.iter(|| {
                black_box(
                    compare_sectors(&XxhPattern, data, 0, &[BlockKey::new(9)], kbs, name).unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, point_benchmarks, sweep_benchmarks, compare_benchmarks);
criterion_main!(benches);
