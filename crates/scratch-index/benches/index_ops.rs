//! Benchmark: block index add/get/remove on a 2^20-slot table.
//!
//! Measures the lock-free read path against the mutexed write path, with
//! keys spread over distinct buckets and keys piled on one collision chain.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use scratch_index::BlockIndex;
use scratch_types::{BlockAddress, FileId, Hash128};

fn addr(offset: u64) -> BlockAddress {
    BlockAddress::new(FileId::new(1).unwrap(), offset).unwrap()
}

fn spread_hash(i: u64) -> Hash128 {
    Hash128::new(i, (i << 24) | (i & 0xF_FFFF))
}

fn chained_hash(i: u64) -> Hash128 {
    // Same bucket for every key: worst-case chain walk.
    Hash128::new(i, (i << 24) | 42)
}

fn bench_get(c: &mut Criterion) {
    let index = BlockIndex::with_slot_bits(20).unwrap();
    for i in 0..10_000 {
        index.add(1, spread_hash(i), addr(i * 4096)).unwrap();
    }
    for i in 0..16 {
        index.add(1, chained_hash(i), addr(i * 4096)).unwrap();
    }

    let mut group = c.benchmark_group("get");

    group.bench_function("spread", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(index.get(1, spread_hash(black_box(i))))
        });
    });

    group.bench_function("chain_of_16", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            i = (i + 1) % 16;
            black_box(index.get(1, chained_hash(black_box(i))))
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| black_box(index.get(1, spread_hash(black_box(999_999)))));
    });

    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    let index = BlockIndex::with_slot_bits(20).unwrap();

    c.bench_function("add_remove_cycle", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            i += 1;
            let hash = spread_hash(i % 100_000);
            index.add(1, hash, addr(4096)).unwrap();
            index.remove(1, hash, addr(4096));
        });
    });
}

criterion_group!(benches, bench_get, bench_add_remove);
criterion_main!(benches);
