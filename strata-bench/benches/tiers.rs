//! Strata benchmark suite.
//!
//! Targets:
//!   fast_store_single ............... < 5μs
//!   fast_retrieve_hit_from_1000 ..... < 2μs
//!   fast_query_tag_from_1000 ........ < 200μs
//!   fast_decay_sweep_1000 ........... < 500μs
//!   coordinator_retrieve_durable .... < 200μs

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use strata_core::decay;
use strata_core::fast::FastStore;
use strata_core::{Coordinator, Importance, MemoryKind, MemoryQuery, MemoryRecord, StrataConfig};

const KINDS: [MemoryKind; 4] = [
    MemoryKind::Event,
    MemoryKind::Decision,
    MemoryKind::Location,
    MemoryKind::CombatPattern,
];

fn make_record(i: usize) -> MemoryRecord {
    let importance = Importance::ALL[i % Importance::ALL.len()];
    let mut record = MemoryRecord::new(KINDS[i % KINDS.len()], format!("observation number {i}"))
        .with_importance(importance)
        .with_tags([format!("zone-{}", i % 16), format!("npc-{}", i % 64)]);
    record.strength = ((i * 37) % 100) as f64 / 100.0;
    record
}

fn filled_store(n: usize) -> (FastStore, Vec<strata_core::MemoryId>) {
    let store = FastStore::new(n);
    let ids = (0..n).map(|i| store.store(make_record(i))).collect();
    (store, ids)
}

/// Benchmark: single insert into a store with spare capacity.
fn bench_fast_store(c: &mut Criterion) {
    let store = FastStore::new(1_000_000);
    let mut i = 0;
    c.bench_function("fast_store_single", |b| {
        b.iter(|| {
            i += 1;
            black_box(store.store(make_record(black_box(i))));
        });
    });
}

/// Benchmark: insert into a full store, forcing a strength-ordered eviction.
fn bench_fast_store_evicting(c: &mut Criterion) {
    let (store, _) = filled_store(1000);
    let mut i = 1000;
    c.bench_function("fast_store_evicting_at_1000", |b| {
        b.iter(|| {
            i += 1;
            black_box(store.store(make_record(black_box(i))));
        });
    });
}

/// Benchmark: retrieval hit (lookup + reinforce + LRU bump).
fn bench_fast_retrieve(c: &mut Criterion) {
    let (store, ids) = filled_store(1000);
    let mut i = 0;
    c.bench_function("fast_retrieve_hit_from_1000", |b| {
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(store.retrieve(black_box(&ids[i])));
        });
    });
}

/// Benchmark: index-narrowed query.
fn bench_fast_query(c: &mut Criterion) {
    let (store, _) = filled_store(1000);
    let query = MemoryQuery::new()
        .kinds([MemoryKind::Event])
        .tags(["zone-3"])
        .min_strength(0.2)
        .limit(20);
    c.bench_function("fast_query_tag_from_1000", |b| {
        b.iter(|| black_box(store.query(black_box(&query))));
    });
}

/// Benchmark: decay sweep over a full store (fresh copy each iteration).
fn bench_decay_sweep(c: &mut Criterion) {
    c.bench_function("fast_decay_sweep_1000", |b| {
        b.iter_batched(
            || filled_store(1000).0,
            |store| black_box(store.apply_decay_all(black_box(0.5))),
            BatchSize::LargeInput,
        );
    });
}

/// Benchmark: the pure decay function.
fn bench_decay_fn(c: &mut Criterion) {
    c.bench_function("decayed_strength", |b| {
        b.iter(|| {
            decay::decayed_strength(
                black_box(0.8),
                black_box(decay::DEFAULT_DECAY_RATE),
                black_box(Importance::Normal),
                black_box(2.5),
            )
        });
    });
}

/// Benchmark: durable hit through the coordinator (SQLite read + promote).
fn bench_coordinator_durable_retrieve(c: &mut Criterion) {
    let Ok(rt) = tokio::runtime::Runtime::new() else {
        return;
    };
    let coordinator = Coordinator::from_config(StrataConfig::in_memory());
    let ids: Vec<_> = rt.block_on(async {
        coordinator.initialize().await;
        let mut ids = Vec::new();
        for i in 0..200 {
            let record = make_record(i);
            if coordinator.durable().store(&record).await {
                ids.push(record.id);
            }
        }
        ids
    });
    if ids.is_empty() {
        return;
    }

    let mut i = 0;
    c.bench_function("coordinator_retrieve_durable", |b| {
        b.iter(|| {
            i = (i + 1) % ids.len();
            let id = ids[i];
            coordinator.fast().remove(&id);
            black_box(rt.block_on(coordinator.retrieve(black_box(&id))));
        });
    });
}

criterion_group!(
    benches,
    bench_fast_store,
    bench_fast_store_evicting,
    bench_fast_retrieve,
    bench_fast_query,
    bench_decay_sweep,
    bench_decay_fn,
    bench_coordinator_durable_retrieve,
);
criterion_main!(benches);
