//! Integration tests for mutator barriers and locals.

#![cfg(feature = "test-util")]

use tenure_gc::test_util::{self, small_config};
use tenure_gc::{CollectionType, GcMode, GenerationMode, Heap, ObjectShape};

#[test]
fn test_satb_keeps_overwritten_humongous_object_for_one_cycle() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let words = heap.region_layout().region_size_words;
    let mut mutator = heap.attach_mutator();
    let (holder, humongous) = {
        let mut scope = mutator.scope();
        let holder = scope.alloc(ObjectShape::instance(1, 0)).unwrap();
        let x = scope.alloc(ObjectShape::instance(0, words)).unwrap();
        scope.write_data(x, words - 1, 77).unwrap();
        scope.store_ref(holder, 0, Some(x)).unwrap();
        (scope.handle(holder).unwrap(), scope.address(x).unwrap())
    };
    let start = heap.region_index(humongous).unwrap();
    assert!(heap.regions()[start].is_humongous_start());

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    {
        let mut scope = mutator.scope();
        let obj = scope.from_handle(&holder).unwrap();
        scope.store_ref(obj, 0, None).unwrap();
    }
    assert_eq!(cycle.run().collection_type, CollectionType::Concurrent);
    assert!(heap.regions()[start].is_humongous_start(), "snapshot object reclaimed early");
    assert_eq!(test_util::data_at(humongous, words - 1), 77);

    heap.collect(GenerationMode::Global);
    assert!(heap.regions()[start].is_empty());
    assert!(heap.regions()[start + 1].is_empty());
}

#[test]
fn test_iu_store_during_marking_keeps_moved_object() {
    let heap = Heap::new(small_config(GcMode::Iu)).unwrap();
    let roots = test_util::sparse_objects(&heap, 2);
    let mut mutator = heap.attach_mutator();
    let (a, b) = {
        let mut scope = mutator.scope();
        let a = scope.alloc(ObjectShape::instance(1, 0)).unwrap();
        let b = scope.alloc(ObjectShape::instance(1, 0)).unwrap();
        let x = scope.alloc(ObjectShape::instance(0, 1)).unwrap();
        scope.write_data(x, 0, 4242).unwrap();
        scope.store_ref(b, 0, Some(x)).unwrap();
        (scope.handle(a).unwrap(), scope.handle(b).unwrap())
    };

    let mut cycle = heap.begin_cycle(GenerationMode::Global);
    assert!(cycle.init_mark());
    {
        let mut scope = mutator.scope();
        let a = scope.from_handle(&a).unwrap();
        let b = scope.from_handle(&b).unwrap();
        let x = scope.load_ref(b, 0).unwrap();
        scope.store_ref(a, 0, x).unwrap();
        scope.store_ref(b, 0, None).unwrap();
    }
    assert_eq!(cycle.run().collection_type, CollectionType::Concurrent);

    let mut scope = mutator.scope();
    let a = scope.from_handle(&a).unwrap();
    let x = scope.load_ref(a, 0).unwrap().unwrap();
    assert_eq!(scope.read_data(x, 0).unwrap(), 4242);
    drop(scope);
    drop(mutator);
    test_util::assert_sparse_intact(&heap, &roots);
}

#[test]
fn test_locals_follow_objects_across_collection() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    let mut mutator = heap.attach_mutator();
    let (keep, other) = {
        let mut scope = mutator.scope();
        let keep = scope.alloc(ObjectShape::instance(1, 2)).unwrap();
        let other = scope.alloc(ObjectShape::instance(0, 1)).unwrap();
        scope.write_data(keep, 0, 5).unwrap();
        scope.write_data(other, 0, 6).unwrap();
        scope.store_ref(keep, 0, Some(other)).unwrap();
        // Unreachable once this scope closes.
        scope.alloc(ObjectShape::instance(0, heap.region_layout().region_size_words / 2)).unwrap();
        (scope.handle(keep).unwrap(), scope.handle(other).unwrap())
    };

    let mut scope = mutator.scope();
    let keep = scope.from_handle(&keep).unwrap();
    let other = scope.from_handle(&other).unwrap();
    let before = scope.address(keep).unwrap();

    let metrics = scope.collect(GenerationMode::Global);
    assert_eq!(metrics.collection_type, CollectionType::Concurrent);
    assert_eq!(metrics.cset_regions, 1);
    assert_ne!(scope.address(keep).unwrap(), before);
    assert_eq!(scope.read_data(keep, 0).unwrap(), 5);
    let loaded = scope.load_ref(keep, 0).unwrap().unwrap();
    assert!(scope.same_object(loaded, other).unwrap());
    assert_eq!(scope.read_data(other, 0).unwrap(), 6);
}

#[test]
fn test_handles_root_objects_between_scopes() {
    let heap = Heap::new(small_config(GcMode::Generational)).unwrap();
    let mut mutator = heap.attach_mutator();
    let handle = {
        let mut scope = mutator.scope();
        let obj = scope.alloc(ObjectShape::instance(0, 1)).unwrap();
        scope.write_data(obj, 0, 11).unwrap();
        scope.handle(obj).unwrap()
    };
    assert_eq!(heap.roots().handle_count(), 1);
    heap.collect(GenerationMode::Young);
    heap.collect_full();

    let mut scope = mutator.scope();
    let obj = scope.from_handle(&handle).unwrap();
    assert_eq!(scope.read_data(obj, 0).unwrap(), 11);

    let replacement = scope.alloc(ObjectShape::instance(0, 1)).unwrap();
    scope.write_data(replacement, 0, 12).unwrap();
    scope.store_handle(&handle, Some(replacement)).unwrap();
    let obj = scope.from_handle(&handle).unwrap();
    assert_eq!(scope.read_data(obj, 0).unwrap(), 12);
    scope.store_handle(&handle, None).unwrap();
    assert!(handle.is_null());
    assert!(scope.from_handle(&handle).is_none());
}

#[test]
fn test_many_threads_allocate_and_collect() {
    let heap = Heap::new(small_config(GcMode::Satb)).unwrap();
    std::thread::scope(|s| {
        for t in 0..4 {
            let heap = &heap;
            s.spawn(move || {
                let mut mutator = heap.attach_mutator();
                let root = {
                    let mut scope = mutator.scope();
                    let obj = scope.alloc(ObjectShape::instance(1, 1)).unwrap();
                    scope.write_data(obj, 0, t).unwrap();
                    scope.handle(obj).unwrap()
                };
                for round in 0..300 {
                    let mut scope = mutator.scope();
                    let head = scope.from_handle(&root).unwrap();
                    let node = scope.alloc(ObjectShape::instance(1, 61)).unwrap();
                    scope.write_data(node, 0, round).unwrap();
                    let prev = scope.load_ref(head, 0).unwrap();
                    if round % 8 != 0 {
                        scope.store_ref(node, 0, prev).unwrap();
                    }
                    scope.store_ref(head, 0, Some(node)).unwrap();
                    scope.safepoint_poll();
                    if round % 100 == 99 {
                        scope.collect(GenerationMode::Global);
                    }
                }
                let mut scope = mutator.scope();
                let head = scope.from_handle(&root).unwrap();
                assert_eq!(scope.read_data(head, 0).unwrap(), t);
                let mut node = scope.load_ref(head, 0).unwrap();
                let mut expect = 299;
                while let Some(n) = node {
                    assert_eq!(scope.read_data(n, 0).unwrap(), expect);
                    expect -= 1;
                    node = scope.load_ref(n, 0).unwrap();
                }
                assert_eq!(expect, 295);
            });
        }
    });
    assert!(heap.gc_count() >= 1);
}
