//! Integration tests for escalation from degenerated cycles to full GC.

#![cfg(feature = "test-util")]

use tenure_gc::test_util::{self, small_config};
use tenure_gc::{CollectionType, GcMode, GenerationMode, Heap};

#[test]
fn test_pinned_cset_region_escalates_to_full_gc() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let roots = test_util::sparse_objects(&heap, 8);
    test_util::garbage_regions(&heap, 2);
    let addrs: Vec<usize> = roots.iter().map(test_util::handle_address).collect();

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(cycle.concurrent_mark());
    assert!(cycle.final_mark());
    assert!(heap.in_collection_set(addrs[0]));

    let pin = test_util::pin_in_place(&heap, &roots[0]).unwrap();
    assert!(test_util::cancel(&heap));
    let metrics = cycle.degenerate();

    assert_eq!(metrics.collection_type, CollectionType::Full);
    assert_eq!(heap.metrics().full_cycles(), 1);
    assert_eq!(heap.metrics().upgrades_to_full(), 1);
    assert_eq!(heap.metrics().degenerated_cycles(), 0);
    for (root, &addr) in roots.iter().zip(&addrs) {
        assert_eq!(test_util::handle_address(root), addr, "object in pinned region moved");
        assert_eq!(test_util::forwardee(addr), None);
    }
    let region = heap.region_for(addrs[0]).unwrap();
    assert!(region.is_pinned());
    assert!(!region.is_cset());
    test_util::assert_sparse_intact(&heap, &roots);

    drop(pin);
    let metrics = heap.collect(GenerationMode::Global);
    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert!(!heap.region_for(addrs[0]).unwrap().is_pinned());
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_region_pinned_before_final_mark_stays_out_of_cset() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let roots = test_util::sparse_objects(&heap, 8);
    let addr = test_util::handle_address(&roots[3]);

    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let obj = scope.from_handle(&roots[3]).unwrap();
    let pin = scope.pin(obj).unwrap();
    assert_eq!(pin.address(), addr);
    drop(scope);

    let metrics = heap.collect(GenerationMode::Global);
    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert_eq!(test_util::handle_address(&roots[3]), addr);
    assert!(heap.region_for(addr).unwrap().is_pinned());
    drop(pin);
    drop(mutator);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_futile_degenerated_cycle_upgrades_to_full_gc() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let roots = test_util::sparse_objects(&heap, 4);

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(test_util::cancel(&heap));
    let metrics = cycle.degenerate();

    assert_eq!(metrics.collection_type, CollectionType::Full);
    assert_eq!(heap.metrics().upgrades_to_full(), 1);
    assert_eq!(heap.metrics().degenerated_cycles(), 0);
    assert!(!heap.is_cancelled());
    test_util::assert_sparse_intact(&heap, &roots);
}
