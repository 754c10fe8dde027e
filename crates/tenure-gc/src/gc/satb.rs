//! Snapshot-at-the-beginning buffers.
//!
//! Mutators record overwritten references (or, in incremental-update mode,
//! newly stored ones) into a thread-local buffer. Full buffers are handed
//! to a shared queue that marking workers drain.

use crossbeam_queue::SegQueue;

/// Completed SATB buffers shared by all threads.
#[derive(Debug)]
pub struct SatbQueueSet {
    completed: SegQueue<Vec<usize>>,
    buffer_size: usize,
}

impl SatbQueueSet {
    /// Queue set handing off thread buffers of `buffer_size` entries.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            completed: SegQueue::new(),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Records `addr` in `buffer`, publishing the buffer once it is full.
    #[inline]
    pub fn enqueue(&self, buffer: &mut Vec<usize>, addr: usize) {
        if buffer.capacity() == 0 {
            buffer.reserve_exact(self.buffer_size);
        }
        buffer.push(addr);
        if buffer.len() >= self.buffer_size {
            self.flush(buffer);
        }
    }

    /// Publishes a partially filled buffer.
    pub fn flush(&self, buffer: &mut Vec<usize>) {
        if !buffer.is_empty() {
            self.completed.push(std::mem::take(buffer));
        }
    }

    /// Whether completed buffers are waiting.
    #[must_use]
    pub fn has_completed(&self) -> bool {
        !self.completed.is_empty()
    }

    /// Pops one completed buffer and feeds its entries to `f`. Returns
    /// `false` when nothing was queued.
    pub fn drain_one(&self, mut f: impl FnMut(usize)) -> bool {
        let Some(buffer) = self.completed.pop() else {
            return false;
        };
        buffer.into_iter().for_each(&mut f);
        true
    }

    /// Drains every completed buffer.
    pub fn drain_all(&self, mut f: impl FnMut(usize)) {
        while self.drain_one(&mut f) {}
    }

    /// Drops every completed buffer.
    pub fn abandon(&self) {
        while self.completed.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_buffer_is_published() {
        let set = SatbQueueSet::new(4);
        let mut local = Vec::new();
        for i in 0..3 {
            set.enqueue(&mut local, 0x1000 + i * 16);
        }
        assert!(!set.has_completed());
        set.enqueue(&mut local, 0x2000);
        assert!(set.has_completed());
        assert!(local.is_empty());

        let mut seen = Vec::new();
        set.drain_all(|a| seen.push(a));
        assert_eq!(seen, vec![0x1000, 0x1010, 0x1020, 0x2000]);
    }

    #[test]
    fn test_flush_and_abandon() {
        let set = SatbQueueSet::new(16);
        let mut local = vec![1, 2];
        set.flush(&mut local);
        set.flush(&mut local);
        assert!(set.has_completed());
        set.abandon();
        assert!(!set.drain_one(|_| {}));
    }
}
