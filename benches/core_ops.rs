// Copyright 2025 Vivian Voss. Licensed under the Apache License, Version 2.0.
// SPDX-License-Identifier: Apache-2.0

//! Core engine operation benchmarks.
//!
//! Measures performance of:
//! - HashStore::get/set - point lookups and inserts
//! - HashStore::remove - deletion
//! - BPlusTree::set/get - ordered index insert and lookup
//! - BPlusTree::iterate - in-order traversal
//! - concurrent reads across threads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kivi::btree::BPlusTree;
use kivi::comparator::LexicalComparator;
use kivi::config::OpenOptions;
use kivi::hashstore::HashStore;
use tempfile::TempDir;

fn key(i: usize) -> Vec<u8> {
    format!("key.{:08}", i).into_bytes()
}

fn value_of(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Benchmark HashStore::set for increasing value sizes.
fn bench_hashstore_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashstore_set");

    for size in [64, 1024, 16_384].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &sz| {
            let value = value_of(sz);
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let path = dir.path().join("bench.kch");
                    let store = HashStore::open(&path, OpenOptions::new()).unwrap();
                    (store, dir)
                },
                |(mut store, _dir)| {
                    black_box(store.set(b"bench-key", &value).unwrap());
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark HashStore::get on a store pre-populated with N records.
fn bench_hashstore_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashstore_get");

    for count in [100, 1_000, 10_000].iter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.kch");
        let mut store = HashStore::open(&path, OpenOptions::new().bucket_count(*count as u64)).unwrap();
        for i in 0..*count {
            store.set(&key(i), b"value").unwrap();
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &cnt| {
            b.iter(|| {
                black_box(store.get(&key(cnt / 2)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark HashStore::remove.
fn bench_hashstore_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashstore_remove");
    group.sample_size(30);

    group.bench_function("remove_existing", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("bench.kch");
                let mut store = HashStore::open(&path, OpenOptions::new()).unwrap();
                store.set(b"bench-key", b"value").unwrap();
                (store, dir)
            },
            |(mut store, _dir)| {
                black_box(store.remove(b"bench-key").unwrap());
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark BPlusTree::set, in increasing-key (append-mostly) order.
fn bench_btree_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_set");
    group.sample_size(20);

    for count in [100, 1_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &cnt| {
            b.iter_batched(
                || {
                    let dir = TempDir::new().unwrap();
                    let path = dir.path().join("bench.kct");
                    let tree = BPlusTree::open(&path, OpenOptions::new().page_size(4096), Box::new(LexicalComparator)).unwrap();
                    (tree, dir)
                },
                |(mut tree, _dir)| {
                    for i in 0..cnt {
                        black_box(tree.set(&key(i), b"value").unwrap());
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark BPlusTree::get on a pre-populated tree.
fn bench_btree_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_get");

    for count in [100, 1_000, 10_000].iter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.kct");
        let mut tree = BPlusTree::open(&path, OpenOptions::new().page_size(4096), Box::new(LexicalComparator)).unwrap();
        for i in 0..*count {
            tree.set(&key(i), b"value").unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &cnt| {
            b.iter(|| {
                black_box(tree.get(&key(cnt / 2)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark full in-order traversal via BPlusTree::iterate.
fn bench_btree_iterate(c: &mut Criterion) {
    struct Counter(usize);
    impl kivi::Visitor for Counter {
        fn visit_full(&mut self, _key: &[u8], _value: &[u8]) -> kivi::VisitDecision {
            self.0 += 1;
            kivi::VisitDecision::Nop
        }
    }

    let mut group = c.benchmark_group("btree_iterate");

    for count in [100, 1_000, 10_000].iter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.kct");
        let mut tree = BPlusTree::open(&path, OpenOptions::new().page_size(4096), Box::new(LexicalComparator)).unwrap();
        for i in 0..*count {
            tree.set(&key(i), b"value").unwrap();
        }

        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let mut counter = Counter(0);
                tree.iterate(&mut counter, false).unwrap();
                black_box(counter.0);
            });
        });
    }

    group.finish();
}

/// Benchmark concurrent HashStore reads across threads. `get` takes `&mut
/// self`, so sharing one handle across threads needs an outer `Mutex` here —
/// the engine itself has no cross-thread sharing story for a single open
/// handle; see SPEC_FULL.md §5.
fn bench_concurrent_reads(c: &mut Criterion) {
    use std::sync::{Arc, Mutex};
    use std::thread;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.kch");
    let mut store = HashStore::open(&path, OpenOptions::new().bucket_count(4096)).unwrap();
    for i in 0..1000 {
        store.set(&key(i), b"value").unwrap();
    }

    let store = Arc::new(Mutex::new(store));

    let mut group = c.benchmark_group("concurrent_reads");

    for thread_count in [1, 2, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(thread_count), thread_count, |b, &threads| {
            b.iter(|| {
                let mut handles = vec![];
                for _ in 0..threads {
                    let store_clone = Arc::clone(&store);
                    handles.push(thread::spawn(move || {
                        for i in 0..100 {
                            black_box(store_clone.lock().unwrap().get(&key(i)).unwrap());
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_hashstore_set,
    bench_hashstore_get,
    bench_hashstore_remove,
    bench_btree_set,
    bench_btree_get,
    bench_btree_iterate,
    bench_concurrent_reads,
);
criterion_main!(benches);
