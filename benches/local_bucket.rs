use std::{hint::black_box, sync::Arc};

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

use tokenbucket::{
    AbuseGuard, AbuseGuardOptions, AbuseThreshold, BucketParams, Capacity, LocalBucketStore,
    RefillRate, SystemClock,
};

fn store(rate: f64, capacity: f64, lock_seconds: u64) -> LocalBucketStore {
    let params = BucketParams::new(
        RefillRate::try_from(rate).unwrap(),
        Capacity::try_from(capacity).unwrap(),
    );

    LocalBucketStore::new(params, lock_seconds, Arc::new(SystemClock))
}

fn bench_hot_key_allowed(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/hot_key_allowed");
    group.sample_size(200);

    group.bench_function("consume", |b| {
        let store = store(1e12, 1e12, 0);
        store.consume("k", 1.0);

        b.iter(|| {
            black_box(store.consume(black_box("k"), black_box(1.0)));
        });
    });

    group.finish();
}

fn bench_many_keys_allowed(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/many_keys_allowed");
    group.sample_size(100);

    for key_space in [1_000_usize, 100_000] {
        group.bench_function(format!("consume/keys={key_space}"), |b| {
            let store = store(1e12, 1e12, 0);
            let keys: Vec<String> = (0..key_space).map(|i| format!("user_{i}")).collect();

            b.iter_batched(
                || 0_usize,
                |mut idx| {
                    idx = idx.wrapping_add(1);
                    let k = &keys[idx % keys.len()];
                    black_box(store.consume(black_box(k), black_box(1.0)));
                    idx
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_reject_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/reject_path");
    group.sample_size(200);

    group.bench_function("consume/insufficient_tokens", |b| {
        let store = store(0.001, 10.0, 0);
        store.consume("k", 10.0);

        b.iter(|| {
            black_box(store.consume(black_box("k"), black_box(1.0)));
        });
    });

    group.bench_function("consume/locked_out", |b| {
        let store = store(0.001, 1.0, 3600);
        store.consume("k", 1.0);
        store.consume("k", 1.0);

        b.iter(|| {
            black_box(store.consume(black_box("k"), black_box(1.0)));
        });
    });

    group.finish();
}

fn bench_abuse_guard(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_bucket/abuse_guard");
    group.sample_size(100);

    group.bench_function("record_consumption/hot_key", |b| {
        let options = AbuseGuardOptions::new(AbuseThreshold::try_from(u64::MAX).unwrap());
        let guard = AbuseGuard::new(options, Arc::new(SystemClock)).unwrap();

        b.iter(|| {
            black_box(guard.record_consumption(black_box("ip")));
        });
    });

    group.bench_function("is_blocked/locked", |b| {
        let options = AbuseGuardOptions::new(AbuseThreshold::try_from(1).unwrap());
        let guard = AbuseGuard::new(options, Arc::new(SystemClock)).unwrap();
        guard.record_consumption("ip");

        b.iter(|| {
            black_box(guard.is_blocked(black_box("ip")));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_hot_key_allowed,
    bench_many_keys_allowed,
    bench_reject_path,
    bench_abuse_guard
);
criterion_main!(benches);
