//! Marking engine.
//!
//! Workers drain per-worker deques seeded from roots, from the remembered
//! set and from SATB buffers. Which references are followed depends on
//! the generation being marked:
//!
//! | cycle  | target young                 | target old                      |
//! |--------|------------------------------|---------------------------------|
//! | young  | mark, push to young queues   | push to old queues when feeding |
//! | old    | dirty the holder's card      | mark, push to old queues        |
//! | global | mark, push                   | mark, push                      |
//!
//! A young reference found in an old object also dirties the slot's card
//! in the write table so the next remembered-set scan sees it again.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::card::{CardSnapshot, RegionChunkIterator};
use crate::gc::mark::{split_array_chunk, split_array_start, ArrayChunk};
use crate::gc::worklist::{MarkTask, TaskQueueSet, TaskTerminator, MAX_CHUNK};
use crate::heap::generation::GenerationMode;
use crate::heap::object::{ObjRef, WORD_SIZE};
use crate::heap::region::Affiliation;
use crate::heap::Heap;

/// Region-indexed live-word counters kept by one worker.
///
/// Counters are narrow to keep the cache small; a counter that would
/// overflow is flushed into its region early.
#[derive(Debug)]
pub(crate) struct LiveCache {
    words: Vec<u16>,
}

impl LiveCache {
    pub(crate) fn new(regions: usize) -> Self {
        Self {
            words: vec![0; regions],
        }
    }

    #[inline]
    fn add(&mut self, heap: &Heap, region: usize, words: usize) {
        let sum = usize::from(self.words[region]) + words;
        match u16::try_from(sum) {
            Ok(v) => self.words[region] = v,
            Err(_) => {
                heap.regions[region].increase_live_words(sum);
                self.words[region] = 0;
            }
        }
    }

    pub(crate) fn flush(&mut self, heap: &Heap) {
        for (index, words) in self.words.iter_mut().enumerate() {
            if *words != 0 {
                heap.regions[index].increase_live_words(usize::from(*words));
                *words = 0;
            }
        }
    }
}

/// One marking pass over a generation.
pub(crate) struct Marker<'a> {
    heap: &'a Heap,
    mode: GenerationMode,
    queues: &'a TaskQueueSet,
    feed_old: bool,
    heal: bool,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(heap: &'a Heap, mode: GenerationMode) -> Self {
        let queues = match mode {
            GenerationMode::Old => heap.old_gen.queues(),
            _ => &heap.mark_queues,
        };
        Self {
            heap,
            mode,
            queues,
            feed_old: mode == GenerationMode::Young
                && heap.config.mode.is_generational()
                && heap.old_gen.is_feeding_old_marking(),
            heal: false,
        }
    }

    /// Resolve forwarded referents and rewrite the slots that held them.
    /// Full collections mark a heap that may still hold forwarded objects.
    pub(crate) const fn healing(mut self) -> Self {
        self.heal = true;
        self
    }

    #[inline]
    fn mark_and_push(&self, queues: &TaskQueueSet, worker: usize, live: &mut LiveCache, obj: ObjRef) {
        if self.heap.marking.mark(obj) {
            let region = self.heap.region_of(obj).index();
            live.add(self.heap, region, obj.size_words());
            queues.push(worker, MarkTask::object(obj));
        }
    }

    /// Follows the reference held in `slot`.
    fn mark_ref(
        &self,
        worker: usize,
        live: &mut LiveCache,
        holder: Option<ObjRef>,
        slot_addr: usize,
        slot: &AtomicUsize,
    ) {
        let raw = slot.load(Ordering::Acquire);
        let Some(mut obj) = ObjRef::from_raw(raw) else {
            return;
        };
        if self.heal {
            let resolved = obj.resolve_forwarded();
            if resolved != obj {
                let _ = slot.compare_exchange(raw, resolved.addr(), Ordering::Release, Ordering::Relaxed);
                obj = resolved;
            }
        }
        let target = self.heap.region_of(obj).affiliation();
        let holder_is_old = holder.is_some_and(|h| self.heap.region_of(h).is_old());
        match (self.mode, target) {
            (GenerationMode::Global, _) => self.mark_and_push(self.queues, worker, live, obj),
            (GenerationMode::Young, Affiliation::Young) => {
                if holder_is_old {
                    self.heap.rset.cards().dirty_write(slot_addr);
                }
                self.mark_and_push(self.queues, worker, live, obj);
            }
            (GenerationMode::Young, Affiliation::Old) if self.feed_old => {
                self.mark_and_push(self.heap.old_gen.queues(), worker, live, obj);
            }
            (GenerationMode::Old, Affiliation::Old) => {
                self.mark_and_push(self.queues, worker, live, obj);
            }
            (GenerationMode::Old, Affiliation::Young) if holder_is_old => {
                self.heap.rset.cards().dirty_write(slot_addr);
            }
            _ => {}
        }
    }

    /// Follows a bare reference taken from an SATB buffer.
    fn mark_value(&self, worker: usize, live: &mut LiveCache, raw: usize) {
        let Some(obj) = ObjRef::from_raw(raw) else {
            return;
        };
        let Some(region) = self.heap.region_for(obj.addr()) else {
            return;
        };
        match (self.mode, region.affiliation()) {
            (GenerationMode::Global, Affiliation::Young | Affiliation::Old)
            | (GenerationMode::Young, Affiliation::Young)
            | (GenerationMode::Old, Affiliation::Old) => {
                self.mark_and_push(self.queues, worker, live, obj);
            }
            (GenerationMode::Young, Affiliation::Old) if self.feed_old => {
                self.mark_and_push(self.heap.old_gen.queues(), worker, live, obj);
            }
            _ => {}
        }
    }

    /// Marks everything directly reachable from roots. Pause only; tasks
    /// are spread over the worker deques.
    pub(crate) fn scan_roots(&self) {
        let mut live = LiveCache::new(self.heap.regions.len());
        let workers = self.queues.workers();
        let mut next = 0;
        self.heap.roots_do(&mut |slot| {
            self.mark_ref(next % workers, &mut live, None, 0, slot);
            next += 1;
        });
        live.flush(self.heap);
    }

    /// Scans dirty cards of old regions for young referents. Returns
    /// `false` when cancelled.
    pub(crate) fn scan_remembered_set(&self, cancellable: bool) -> bool {
        let heap = self.heap;
        let chunks = RegionChunkIterator::new(
            heap.regions.len(),
            heap.layout.region_size_words,
            heap.workers.len(),
        );
        let stable = heap.old_gen.state().is_remembered_set_stable() && heap.marking.is_old_complete();
        heap.workers.run(|worker, _, _| {
            let mut live = LiveCache::new(heap.regions.len());
            while let Some(chunk) = chunks.next() {
                if cancellable && heap.cancel.is_cancelled() {
                    break;
                }
                let region = &heap.regions[chunk.region];
                if !region.is_old() || !(region.is_regular() || region.is_pinned()) {
                    continue;
                }
                let from = region.bottom() + chunk.offset_words * WORD_SIZE;
                let to = (from + chunk.size_words * WORD_SIZE).min(region.top());
                heap.rset.scan_dirty(
                    region.bottom(),
                    from,
                    to,
                    CardSnapshot::Read,
                    |obj| !stable || heap.marking.is_marked(obj),
                    |holder, addr, slot| self.mark_ref(worker, &mut live, Some(holder), addr, slot),
                );
            }
            live.flush(heap);
        });
        !(cancellable && heap.cancel.is_cancelled())
    }

    fn process(&self, worker: usize, live: &mut LiveCache, task: MarkTask) {
        let obj = task.obj();
        let stride = self.heap.config.obj_array_marking_stride;
        let push = |c: ArrayChunk| self.queues.push(worker, MarkTask::array_chunk(obj, c.chunk, c.pow));
        let range = if task.chunk() == 0 {
            let layout = obj.layout();
            if layout.is_ref_array() {
                split_array_start(layout.ref_count(), stride, MAX_CHUNK, push)
            } else {
                0..layout.ref_count()
            }
        } else {
            let chunk = ArrayChunk {
                chunk: task.chunk(),
                pow: task.pow(),
            };
            split_array_chunk(chunk, stride, MAX_CHUNK, push)
        };
        obj.slots_in(range.start, range.end, |addr, slot| {
            self.mark_ref(worker, live, Some(obj), addr, slot);
        });
    }

    /// One worker's share of the drain loop.
    fn drain(&self, worker: usize, terminator: &TaskTerminator, cancellable: bool) {
        let heap = self.heap;
        let stride = heap.config.mark_loop_stride.max(1);
        let mut live = LiveCache::new(heap.regions.len());
        let is_cancelled = || cancellable && heap.cancel.is_cancelled();
        loop {
            for _ in 0..stride {
                match self.queues.pop(worker).or_else(|| self.queues.steal(worker)) {
                    Some(task) => self.process(worker, &mut live, task),
                    None => break,
                }
            }
            heap.satb.drain_one(|raw| self.mark_value(worker, &mut live, raw));
            if is_cancelled() {
                break;
            }
            if self.queues.is_empty()
                && !heap.satb.has_completed()
                && terminator.offer_termination(self.queues, is_cancelled)
            {
                break;
            }
        }
        live.flush(heap);
    }

    /// Drains the queues and the completed SATB buffers on every worker.
    /// Returns `false` when cancelled before the work ran out.
    pub(crate) fn mark(&self, cancellable: bool) -> bool {
        let terminator = TaskTerminator::new(self.heap.workers.len());
        self.heap
            .workers
            .run(|worker, _, _| self.drain(worker, &terminator, cancellable));
        !(cancellable && self.heap.cancel.is_cancelled())
    }
}

impl Heap {
    /// Resets marking state of the regions a `mode` cycle collects. Pause
    /// only.
    pub(crate) fn prepare_marking(&self, mode: GenerationMode) {
        for region in self.regions.iter() {
            if !Self::in_generation(region, mode) {
                continue;
            }
            self.marking.capture_tams(region);
            self.marking.clear_bitmap(region);
            region.clear_live();
        }
        match mode {
            GenerationMode::Old => self.marking.set_old_complete(false),
            GenerationMode::Young => self.marking.set_young_complete(false),
            GenerationMode::Global => {
                self.marking.set_young_complete(false);
                self.marking.set_old_complete(false);
            }
        }
        if mode != GenerationMode::Old {
            self.mark_queues.clear();
        }
    }

    /// Estimated live bytes of a region after marking: marked words plus
    /// everything allocated above TAMS.
    pub(crate) fn live_estimate(&self, index: usize) -> usize {
        let region = &self.regions[index];
        let tams = self.marking.tams(index).max(region.bottom());
        region.live_bytes() + region.top().saturating_sub(tams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, REGION_SIZE_FLOOR};
    use crate::heap::alloc::AllocRequest;
    use crate::heap::object::{init_object, ObjectShape};

    fn heap() -> Heap {
        let config = GcConfig::default()
            .with_heap_size(2 << 20)
            .with_region_size_bounds(REGION_SIZE_FLOOR.max(sys_alloc::allocation_granularity()), 1 << 20)
            .with_target_regions(32)
            .with_parallel_workers(2);
        Heap::new(config).unwrap()
    }

    fn alloc(heap: &Heap, shape: ObjectShape) -> ObjRef {
        let mut req = AllocRequest::shared(shape.size_words());
        let addr = heap.allocate_memory(&mut req).unwrap();
        // SAFETY: freshly allocated, committed and unshared.
        unsafe { init_object(addr, shape) }
    }

    #[test]
    fn test_live_cache_flushes_on_overflow() {
        let heap = heap();
        let mut cache = LiveCache::new(heap.region_count());
        cache.add(&heap, 3, usize::from(u16::MAX));
        assert_eq!(heap.regions()[3].live_bytes(), 0);
        cache.add(&heap, 3, 2);
        assert_eq!(heap.regions()[3].live_bytes(), (usize::from(u16::MAX) + 2) * WORD_SIZE);
        cache.add(&heap, 3, 4);
        cache.flush(&heap);
        assert_eq!(heap.regions()[3].live_bytes(), (usize::from(u16::MAX) + 6) * WORD_SIZE);
    }

    #[test]
    fn test_marks_reachable_graph_only() {
        let heap = heap();
        let root = alloc(&heap, ObjectShape::instance(2, 0));
        let child = alloc(&heap, ObjectShape::ref_array(5000));
        let leaf = alloc(&heap, ObjectShape::instance(0, 1));
        let garbage = alloc(&heap, ObjectShape::instance(1, 0));
        root.ref_slot(0).store(child.addr(), Ordering::Relaxed);
        child.ref_slot(4321).store(leaf.addr(), Ordering::Relaxed);
        garbage.ref_slot(0).store(leaf.addr(), Ordering::Relaxed);
        let handle = heap.roots().new_handle(root.addr());

        heap.prepare_marking(GenerationMode::Global);
        let marker = Marker::new(&heap, GenerationMode::Global);
        marker.scan_roots();
        assert!(marker.mark(false));

        for obj in [root, child, leaf] {
            assert!(heap.marking_context().is_marked(obj), "{obj:?}");
        }
        assert!(!heap.marking_context().is_marked(garbage));
        let region = heap.region_of(root).index();
        let expected = root.size_bytes() + child.size_bytes() + leaf.size_bytes();
        assert_eq!(heap.regions()[region].live_bytes(), expected);
        drop(handle);
    }

    #[test]
    fn test_objects_above_tams_count_as_live() {
        let heap = heap();
        let old = alloc(&heap, ObjectShape::instance(0, 2));
        heap.prepare_marking(GenerationMode::Global);
        let fresh = alloc(&heap, ObjectShape::instance(0, 2));
        assert!(!heap.marking_context().is_marked(old));
        assert!(heap.marking_context().is_marked(fresh));
        let index = heap.region_of(fresh).index();
        assert_eq!(heap.live_estimate(index), fresh.size_bytes());
    }
}
