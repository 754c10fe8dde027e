//! Integration tests for degenerated cycles.
//!
//! A cancelled concurrent cycle is finished stop-the-world from the step
//! it reached. Objects the mutators already forwarded keep their copies.

#![cfg(feature = "test-util")]

use tenure_gc::test_util::{self, small_config};
use tenure_gc::{CollectionType, GcError, GcMode, GenerationMode, Heap, ObjectShape};

const OBJECTS: usize = 32;

fn setup(mode: GcMode) -> (Heap, Vec<tenure_gc::Handle>) {
    let heap = Heap::new(small_config(mode)).unwrap();
    let roots = test_util::sparse_objects(&heap, OBJECTS);
    test_util::garbage_regions(&heap, 2);
    (heap, roots)
}

#[test]
fn test_cancel_during_evacuation_keeps_mutator_copies() {
    let (heap, roots) = setup(GcMode::Satb);
    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(cycle.concurrent_mark());
    assert!(cycle.final_mark());
    assert!(!heap.collection_set().is_empty());

    let mut mutator = heap.attach_mutator();
    let copies: Vec<(usize, usize)> = {
        let mut scope = mutator.scope();
        roots
            .iter()
            .enumerate()
            .step_by(2)
            .map(|(i, root)| {
                let obj = scope.from_handle(root).unwrap();
                (i, scope.address(obj).unwrap())
            })
            .collect()
    };

    assert!(test_util::cancel(&heap));
    let metrics = cycle.degenerate();
    assert_eq!(metrics.collection_type, CollectionType::Degenerated);
    assert_eq!(metrics.bytes_evacuated, OBJECTS * 32, "every object copied exactly once");
    assert_eq!(heap.metrics().degenerated_cycles(), 1);
    assert_eq!(heap.metrics().upgrades_to_full(), 0);
    assert!(!heap.is_cancelled());

    for &(i, copy) in &copies {
        assert_eq!(test_util::handle_address(&roots[i]), copy, "object {i} moved twice");
    }
    assert!(heap.collection_set().is_empty());
    assert!(heap.regions().iter().all(|r| !r.is_cset() && !r.is_trash()));
    drop(mutator);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_cancel_during_marking_finishes_the_mark() {
    let (heap, roots) = setup(GcMode::Satb);
    let used_before = heap.used();
    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(test_util::cancel(&heap));
    assert!(!cycle.concurrent_mark());

    let metrics = cycle.degenerate();
    assert_eq!(metrics.collection_type, CollectionType::Degenerated);
    assert!(heap.used() < used_before);
    assert!(metrics.bytes_reclaimed() >= heap.region_layout().region_size_bytes);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_dropping_an_unfinished_cycle_degenerates_it() {
    let (heap, roots) = setup(GcMode::Iu);
    {
        let mut cycle = heap.begin_cycle(GenerationMode::Global);
        assert!(cycle.init_mark());
        assert!(cycle.concurrent_mark());
    }
    assert_eq!(heap.metrics().degenerated_cycles(), 1);
    assert_eq!(heap.gc_count(), 1);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_passive_mode_collects_stop_the_world() {
    let (heap, roots) = setup(GcMode::Passive);
    let metrics = heap.collect(GenerationMode::Global);
    assert_eq!(metrics.collection_type, CollectionType::Degenerated);
    assert!(metrics.cset_regions > 0);
    assert_eq!(heap.metrics().concurrent_cycles(), 0);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_exhausted_heap_reports_out_of_memory() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let shape = ObjectShape::instance(0, 1000);
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();

    let mut live = Vec::new();
    let err = loop {
        match scope.alloc(shape) {
            Ok(obj) => {
                scope.write_data(obj, 0, live.len()).unwrap();
                live.push(obj);
            }
            Err(err) => break err,
        }
        assert!(live.len() < 10_000, "heap never filled up");
    };

    assert!(matches!(
        err,
        GcError::OutOfMemory { requested_bytes } if requested_bytes == shape.size_words() * 8
    ));
    assert!(heap.metrics().full_cycles() >= 1);
    assert!(heap.metrics().alloc_failures() >= 1);
    for (i, &obj) in live.iter().enumerate() {
        assert_eq!(scope.read_data(obj, 0).unwrap(), i);
    }
}
