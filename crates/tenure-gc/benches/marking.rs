//! Benchmark: concurrent marking of a fully live heap.
//!
//! Nothing is garbage, so no region enters the collection set and each
//! cycle is dominated by tracing.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;
use tenure_gc::{GcConfig, GcMode, GenerationMode, Handle, Heap, ObjectShape};

/// Builds a binary tree of `depth` levels.
fn tree(heap: &Heap, depth: usize) -> Handle {
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let root = scope.alloc(ObjectShape::instance(2, 1)).unwrap();
    let mut level = vec![root];
    for d in 1..depth {
        let mut next = Vec::with_capacity(level.len() * 2);
        for &parent in &level {
            for slot in 0..2 {
                let child = scope.alloc(ObjectShape::instance(2, 1)).unwrap();
                scope.write_data(child, 0, d).unwrap();
                scope.store_ref(parent, slot, Some(child)).unwrap();
                next.push(child);
            }
        }
        level = next;
        scope.safepoint_poll();
    }
    scope.handle(root).unwrap()
}

/// One wide reference array, marked in chunks.
fn wide_array(heap: &Heap, len: usize) -> Handle {
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let array = scope.alloc(ObjectShape::ref_array(len)).unwrap();
    for i in 0..len {
        let leaf = scope.alloc(ObjectShape::instance(0, 1)).unwrap();
        scope.store_ref(array, i, Some(leaf)).unwrap();
    }
    scope.handle(array).unwrap()
}

fn bench_marking(c: &mut Criterion) {
    let mut group = c.benchmark_group("marking");
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(500));

    for workers in [1, 4] {
        let config = GcConfig::default()
            .with_heap_size(128 << 20)
            .with_parallel_workers(workers);
        let heap = Heap::new(config.clone()).unwrap();
        let root = tree(&heap, 17);
        group.bench_function(format!("tree_depth_17_{workers}_workers"), |b| {
            b.iter(|| black_box(heap.collect(GenerationMode::Global)));
        });
        drop(root);

        let heap = Heap::new(config.with_mode(GcMode::Iu)).unwrap();
        let root = wide_array(&heap, 100_000);
        group.bench_function(format!("array_100k_iu_{workers}_workers"), |b| {
            b.iter(|| black_box(heap.collect(GenerationMode::Global)));
        });
        drop(root);
    }
    group.finish();
}

criterion_group!(benches, bench_marking);
criterion_main!(benches);
