// Cache Performance Benchmarks
// Measures hot-path read/write throughput and the drain under mixed
// access patterns.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_cache::{BoundedCache, CacheConfig};
use std::hint::black_box;
use std::sync::Arc;

fn create_cache(maximum: u64) -> BoundedCache<u64, u64> {
    BoundedCache::new(CacheConfig::new().maximum(maximum)).unwrap()
}

fn bench_read_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_hit");

    for size in [1_000u64, 100_000] {
        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, &size| {
            let cache = create_cache(size);
            for key in 0..size {
                cache.put(key, key);
            }
            cache.clean_up();

            let mut key = 0u64;
            b.iter(|| {
                key = (key + 1) % size;
                black_box(cache.get(&key))
            });
        });
    }

    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    group.bench_function("put_over_capacity", |b| {
        let cache = create_cache(10_000);
        let mut key = 0u64;
        b.iter(|| {
            key += 1;
            cache.put(black_box(key), key)
        });
    });

    group.bench_function("put_same_key", |b| {
        let cache = create_cache(10_000);
        let mut value = 0u64;
        b.iter(|| {
            value += 1;
            cache.put(black_box(1), value)
        });
    });

    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_workload");

    group.bench_function("read_mostly", |b| {
        let cache = create_cache(10_000);
        for key in 0..10_000u64 {
            cache.put(key, key);
        }
        cache.clean_up();

        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            if i % 10 == 0 {
                cache.put(black_box(i % 20_000), i);
            } else {
                black_box(cache.get(&(i % 20_000)));
            }
        });
    });

    group.finish();
}

fn bench_concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_reads");
    group.sample_size(20);

    group.bench_function("four_reader_threads", |b| {
        let cache = Arc::new(create_cache(10_000));
        for key in 0..10_000u64 {
            cache.put(key, key);
        }
        cache.clean_up();

        b.iter(|| {
            let mut handles = Vec::new();
            for t in 0..4u64 {
                let cache = Arc::clone(&cache);
                handles.push(std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        black_box(cache.get(&((t * 2_500 + i) % 10_000)));
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_read_hit,
    bench_insert,
    bench_mixed_workload,
    bench_concurrent_reads
);
criterion_main!(benches);
