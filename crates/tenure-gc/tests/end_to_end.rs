//! End-to-end tests: allocate until the heuristics ask for a cycle, run
//! it, and check that every reachable object survived unchanged.

#![cfg(feature = "test-util")]

use tenure_gc::test_util::small_config;
use tenure_gc::{CollectionType, GcMode, GenerationMode, Handle, Heap, ObjectShape, RegionState};

const KEEP: usize = 2048;

/// Allocates batches of garbage, keeping one small object per batch,
/// until a cycle is wanted. Returns the root array and the kept count.
fn allocate_until_triggered(heap: &Heap) -> (Handle, usize) {
    let mut mutator = heap.attach_mutator();
    let root = {
        let mut scope = mutator.scope();
        let array = scope.alloc(ObjectShape::ref_array(KEEP)).unwrap();
        scope.handle(array).unwrap()
    };
    let mut kept = 0;
    while !heap.should_start_gc() {
        assert!(kept < KEEP, "heuristics never triggered");
        let mut scope = mutator.scope();
        let array = scope.from_handle(&root).unwrap();
        for _ in 0..8 {
            scope.alloc(ObjectShape::instance(0, 62)).unwrap();
        }
        let keep = scope.alloc(ObjectShape::instance(1, 2)).unwrap();
        scope.write_data(keep, 0, kept).unwrap();
        scope.write_data(keep, 1, kept.wrapping_mul(0x9e37_79b9)).unwrap();
        if kept > 0 {
            let prev = scope.load_ref(array, kept - 1).unwrap();
            scope.store_ref(keep, 0, prev).unwrap();
        }
        scope.store_ref(array, kept, Some(keep)).unwrap();
        kept += 1;
    }
    assert_eq!(heap.gc_count(), 0, "allocation failed before the trigger");
    (root, kept)
}

fn assert_graph_intact(heap: &Heap, root: &Handle, kept: usize) {
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let array = scope.from_handle(root).unwrap();
    for i in 0..kept {
        let keep = scope.load_ref(array, i).unwrap().unwrap();
        assert_eq!(scope.read_data(keep, 0).unwrap(), i);
        assert_eq!(scope.read_data(keep, 1).unwrap(), i.wrapping_mul(0x9e37_79b9));
        let prev = scope.load_ref(keep, 0).unwrap();
        match (i, prev) {
            (0, None) => {}
            (_, Some(prev)) => assert_eq!(scope.read_data(prev, 0).unwrap(), i - 1),
            (_, None) => panic!("object {i} lost its link"),
        }
    }
}

fn assert_bounded(heap: &Heap) {
    assert!(heap.used() <= heap.committed());
    assert!(heap.committed() <= heap.capacity());
}

fn run_triggered_cycle(mode: GcMode, generation: GenerationMode) {
    let heap = Heap::new(small_config(mode)).unwrap();
    let (root, kept) = allocate_until_triggered(&heap);
    let used_before = heap.used();

    let mut cycle = heap.begin_cycle(generation);
    assert!(cycle.init_mark());
    assert_bounded(&heap);
    assert!(cycle.concurrent_mark());
    assert_bounded(&heap);
    assert!(cycle.final_mark());
    assert_bounded(&heap);
    let cset = heap.collection_set().regions();
    assert!(!cset.is_empty());
    assert!(cycle.concurrent_evacuate());
    assert_bounded(&heap);
    assert!(cycle.init_update_refs());
    assert!(cycle.concurrent_update_refs());
    assert_bounded(&heap);
    assert!(cycle.final_update_refs());
    let metrics = cycle.finish();

    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert!(heap.used() < used_before);
    assert_bounded(&heap);
    assert!(heap.collection_set().is_empty());
    for &index in &cset {
        let region = &heap.regions()[index];
        assert!(region.is_empty(), "cset region {index} is {:?}", region.state());
    }
    assert!(heap
        .regions()
        .iter()
        .all(|r| !matches!(r.state(), RegionState::Cset | RegionState::CsetPinned | RegionState::Trash)));
    assert!(!heap.should_start_gc());
    assert_graph_intact(&heap, &root, kept);
}

#[test]
fn test_satb_cycle_preserves_reachable_graph() {
    run_triggered_cycle(GcMode::Satb, GenerationMode::Global);
}

#[test]
fn test_iu_cycle_preserves_reachable_graph() {
    run_triggered_cycle(GcMode::Iu, GenerationMode::Global);
}

#[test]
fn test_young_cycle_preserves_reachable_graph() {
    run_triggered_cycle(GcMode::Generational, GenerationMode::Young);
}

#[test]
fn test_mutators_keep_allocating_across_cycles() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let mut mutator = heap.attach_mutator();
    let root = {
        let mut scope = mutator.scope();
        let array = scope.alloc(ObjectShape::ref_array(64)).unwrap();
        scope.handle(array).unwrap()
    };

    for round in 0..4000 {
        let mut scope = mutator.scope();
        let array = scope.from_handle(&root).unwrap();
        let obj = scope.alloc(ObjectShape::instance(0, 126)).unwrap();
        scope.write_data(obj, 0, round).unwrap();
        scope.store_ref(array, round % 64, Some(obj)).unwrap();
        drop(scope);
        if heap.should_start_gc() {
            heap.collect(GenerationMode::Global);
        }
    }
    assert!(heap.gc_count() >= 1);

    let mut scope = mutator.scope();
    let array = scope.from_handle(&root).unwrap();
    for slot in 0..64 {
        let obj = scope.load_ref(array, slot).unwrap().unwrap();
        assert_eq!(scope.read_data(obj, 0).unwrap() % 64, slot);
    }
}
