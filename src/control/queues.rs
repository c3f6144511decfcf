use crate::control::work::{CloseItem, WorkItem};
use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Single-bit wake deduplicator: armed (false) → fired (true).
///
/// Producers enqueue first, then fire; only the CAS winner signals the wake
/// primitive. The consumer re-arms before draining, so an item enqueued
/// mid-drain re-fires and costs at most one redundant wake.
pub(crate) struct PostedFlag(CachePadded<AtomicBool>);

impl PostedFlag {
    pub fn new() -> Self {
        Self(CachePadded::new(AtomicBool::new(false)))
    }

    /// Producer side. Returns true for the caller that wins the signal.
    #[inline]
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumer side. Re-arm; must happen before the drain reads the queues.
    #[inline]
    pub fn disarm(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Multi-producer work queue, double-buffered.
///
/// Two lock-free sides; producers push into the side selected by `adding`,
/// the consumer flips the selector and drains the retired side FIFO. A
/// producer that loaded the selector just before the flip lands its item in
/// the side being drained, where the pop loop or the re-armed posted flag
/// still picks it up.
pub(crate) struct WorkQueue {
    sides: [SegQueue<WorkItem>; 2],
    adding: CachePadded<AtomicUsize>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            sides: [SegQueue::new(), SegQueue::new()],
            adding: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn push(&self, item: WorkItem) {
        let i = self.adding.load(Ordering::Acquire);
        self.sides[i & 1].push(item);
    }

    /// Consumer only: retire the current adding side and return it for
    /// draining. The flip is sequenced before any pop of the retired side.
    #[inline]
    pub fn swap(&self) -> &SegQueue<WorkItem> {
        let old = self.adding.fetch_xor(1, Ordering::AcqRel);
        &self.sides[old & 1]
    }

    /// Drop every queued item on both sides. Only valid once the loop
    /// thread is gone; pending completions resolve as dropped.
    pub fn clear(&self) {
        for side in &self.sides {
            while side.pop().is_some() {}
        }
    }
}

/// Close-handle queue. Producers are rare (the loop thread itself, plus
/// drop glue), so a short mutex over the adding buffer is enough; the
/// consumer owns the running buffer and swaps it in under the lock.
pub(crate) struct CloseQueue {
    adding: Mutex<VecDeque<CloseItem>>,
}

impl CloseQueue {
    pub fn new() -> Self {
        Self {
            adding: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn push(&self, item: CloseItem) {
        self.adding.lock().push_back(item);
    }

    /// Swap the adding buffer with `running`, which must be empty. Close
    /// callbacks run outside the lock.
    #[inline]
    pub fn swap_into(&self, running: &mut VecDeque<CloseItem>) {
        debug_assert!(running.is_empty());
        std::mem::swap(&mut *self.adding.lock(), running);
    }

    /// Drop every queued item. Only valid once the loop thread is gone.
    pub fn clear(&self) {
        self.adding.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_work() -> WorkItem {
        WorkItem::new(Box::new(|_| Ok(())), None)
    }

    #[test]
    fn posted_flag_dedups_until_disarm() {
        let flag = PostedFlag::new();
        assert!(flag.fire());
        assert!(!flag.fire());
        assert!(flag.disarm());
        assert!(!flag.disarm());
        assert!(flag.fire());
    }

    #[test]
    fn work_queue_swap_retires_adding_side() {
        let q = WorkQueue::new();
        q.push(noop_work());
        q.push(noop_work());

        let retired = q.swap();
        let mut n = 0;
        while retired.pop().is_some() {
            n += 1;
        }
        assert_eq!(n, 2);

        // new pushes land on the other side and survive the drain above
        q.push(noop_work());
        let retired = q.swap();
        assert!(retired.pop().is_some());
        assert!(retired.pop().is_none());
    }

    #[test]
    fn close_queue_swap_leaves_adding_empty() {
        let q = CloseQueue::new();
        q.push(CloseItem::new(Box::new(|_| Ok(()))));

        let mut running = VecDeque::new();
        q.swap_into(&mut running);
        assert_eq!(running.len(), 1);

        let mut second = VecDeque::new();
        q.swap_into(&mut second);
        assert!(second.is_empty());
    }
}
