//! Loom tests for work-stealing queue atomic ordering.

#![cfg(feature = "test-util")]

use std::sync::Arc;

use tenure_gc::gc::worklist::StealQueue;
use tenure_gc::test_util::mark_task;

const QUEUE_SIZE: usize = 4;

/// After a push, a concurrent steal sees either nothing or the task.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist --release"]
fn test_push_then_steal_sees_task() {
    loom::model(|| {
        let queue: Arc<StealQueue<QUEUE_SIZE>> = Arc::new(StealQueue::new());
        let task = mark_task(0x1000);

        let push_thread = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.push(task).is_ok()
        });
        let steal_thread = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });

        let pushed = push_thread.join().unwrap();
        let stolen = steal_thread.join().unwrap();
        assert!(pushed);
        assert!(stolen.is_none() || stolen == Some(task));
    });
}

/// The owner's pop and a thief's steal never both take the last task.
#[test]
#[ignore = "loom test - run with cargo test loom_worklist --release"]
fn test_pop_and_steal_race_for_last_task() {
    loom::model(|| {
        let queue: Arc<StealQueue<QUEUE_SIZE>> = Arc::new(StealQueue::new());
        let task = mark_task(0x2000);
        assert!(queue.push(task).is_ok());

        let steal_thread = loom::thread::spawn({
            let queue = Arc::clone(&queue);
            move || queue.steal()
        });
        let popped = queue.pop();
        let stolen = steal_thread.join().unwrap();

        let taken = usize::from(popped.is_some()) + usize::from(stolen.is_some());
        assert!(taken <= 1);
        if taken == 0 {
            assert_eq!(queue.pop(), Some(task));
        }
        assert!(queue.is_empty());
    });
}
