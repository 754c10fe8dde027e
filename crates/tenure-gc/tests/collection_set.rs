//! Integration tests for collection-set selection.
//!
//! Whatever the heuristics pick, the live bytes of the collection set,
//! scaled by the waste factor, fit in the evacuation reserves.

#![cfg(feature = "test-util")]

use tenure_gc::test_util::{self, small_config};
use tenure_gc::{
    Affiliation, CollectionSetBudget, CollectionType, GcMode, GenerationMode, GenerationStats, Handle,
    Heap, Heuristics, ObjectShape, RegionData,
};

const PAIRS: usize = 2048;

/// Fills about eight regions half with live objects, half with garbage.
fn half_live_regions(heap: &Heap) -> Handle {
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let array = scope.alloc(ObjectShape::ref_array(PAIRS)).unwrap();
    for i in 0..PAIRS {
        let keep = scope.alloc(ObjectShape::instance(0, 30)).unwrap();
        scope.write_data(keep, 0, i).unwrap();
        scope.write_data(keep, 29, !i).unwrap();
        scope.store_ref(array, i, Some(keep)).unwrap();
        scope.alloc(ObjectShape::instance(0, 30)).unwrap();
    }
    scope.handle(array).unwrap()
}

fn assert_half_live_intact(heap: &Heap, root: &Handle) {
    let mut mutator = heap.attach_mutator();
    let mut scope = mutator.scope();
    let array = scope.from_handle(root).unwrap();
    for i in 0..PAIRS {
        let keep = scope.load_ref(array, i).unwrap().unwrap();
        assert_eq!(scope.read_data(keep, 0).unwrap(), i);
        assert_eq!(scope.read_data(keep, 29).unwrap(), !i);
    }
}

fn assert_within_reserves(heap: &Heap) {
    let waste = heap.config().waste_factor();
    let cset = heap.collection_set();
    let budget = heap.budget();
    assert!(cset.young_live_bytes() as f64 * waste <= budget.young_evac_reserve() as f64);
    assert!(cset.old_live_bytes() as f64 * waste <= budget.old_evac_reserve() as f64);
}

#[test]
fn test_collection_set_fits_young_reserve() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let root = half_live_regions(&heap);
    let candidates = heap.regions().iter().filter(|r| r.is_regular()).count();

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(cycle.concurrent_mark());
    assert!(cycle.final_mark());

    let cset = heap.collection_set();
    assert!(!cset.is_empty());
    assert!(cset.len() < candidates, "reserve should bound the collection set");
    assert_within_reserves(&heap);
    for index in cset.regions() {
        assert!(heap.regions()[index].is_cset());
    }

    let selected = cset.len();
    let metrics = cycle.run();
    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert_eq!(metrics.cset_regions, selected);
    assert!(heap.collection_set().is_empty());
    assert_half_live_intact(&heap, &root);
}

#[test]
fn test_mostly_immediate_garbage_skips_evacuation() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let roots = test_util::sparse_objects(&heap, 4);
    test_util::garbage_regions(&heap, 20);

    let metrics = heap.collect(GenerationMode::Global);
    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert_eq!(metrics.cset_regions, 0);
    assert!(metrics.immediate_regions >= 19);
    assert_eq!(metrics.bytes_evacuated, 0);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_generational_global_cycle_respects_both_reserves() {
    let heap = Heap::new(small_config(GcMode::Generational)).unwrap();
    let old: Vec<Handle> = (0..512)
        .map(|_| test_util::alloc_rooted(&heap, ObjectShape::instance(0, 62), Affiliation::Old).unwrap())
        .enumerate()
        .filter_map(|(i, handle)| (i % 2 == 0).then_some(handle))
        .collect();
    let root = half_live_regions(&heap);

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(cycle.concurrent_mark());
    assert!(cycle.final_mark());
    assert_within_reserves(&heap);
    assert_eq!(cycle.run().collection_type, CollectionType::Concurrent);

    assert_half_live_intact(&heap, &root);
    for handle in &old {
        assert!(heap.region_for(test_util::handle_address(handle)).unwrap().is_old());
    }
}

/// Picks every candidate regardless of cost.
#[derive(Debug)]
struct Greedy;

impl Heuristics for Greedy {
    fn choose_collection_set(
        &self,
        candidates: &[RegionData],
        _budget: &CollectionSetBudget,
        selected: &mut Vec<usize>,
    ) {
        selected.extend(candidates.iter().map(|r| r.index));
    }

    fn should_start_gc(&self, _stats: &GenerationStats) -> bool {
        false
    }
}

#[test]
fn test_collector_clamps_greedy_heuristics() {
    let heap = Heap::with_heuristics(small_config(GcMode::Satb), Box::new(Greedy)).unwrap();
    let root = half_live_regions(&heap);

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    assert!(cycle.concurrent_mark());
    assert!(cycle.final_mark());
    assert!(!heap.collection_set().is_empty());
    assert_within_reserves(&heap);
    assert!(!heap.should_start_gc());
    assert_eq!(cycle.run().collection_type, CollectionType::Concurrent);
    assert_half_live_intact(&heap, &root);
}
