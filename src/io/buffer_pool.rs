use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Source of fixed-size buffer blocks for output channels.
///
/// Blocks are plain `BytesMut` allocations of `block_size` capacity. The
/// free list is bounded by `max_blocks`; surplus blocks, and any block
/// returned after [`dispose`](BufferPool::dispose), are dropped.
pub struct BufferPool {
    block_size: usize,
    max_blocks: usize,
    free: Mutex<Vec<BytesMut>>,
    disposed: AtomicBool,
}

impl BufferPool {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        Self {
            block_size,
            max_blocks,
            free: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Pop a free block or allocate a fresh one.
    pub fn take(&self) -> BytesMut {
        if let Some(block) = self.free.lock().pop() {
            return block;
        }
        BytesMut::with_capacity(self.block_size)
    }

    /// Return a block to the free list.
    pub fn put(&self, mut block: BytesMut) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        block.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_blocks {
            free.push(block);
        }
    }

    /// Recycle a sealed segment if this was the last reference to its block.
    pub fn put_bytes(&self, seg: Bytes) {
        if let Ok(block) = seg.try_into_mut() {
            self.put(block);
        }
    }

    /// Release every free block; later returns are dropped.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.free.lock().clear();
    }

    pub fn free_blocks(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_up_to_cap() {
        let pool = BufferPool::new(64, 2);
        let a = pool.take();
        let b = pool.take();
        let c = pool.take();
        pool.put(a);
        pool.put(b);
        pool.put(c);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn sealed_segment_returns_only_when_unique() {
        let pool = BufferPool::new(64, 8);
        let mut block = pool.take();
        block.extend_from_slice(b"hello");
        let seg = block.freeze();

        let alias = seg.clone();
        pool.put_bytes(seg);
        assert_eq!(pool.free_blocks(), 0);

        pool.put_bytes(alias);
        assert_eq!(pool.free_blocks(), 1);
    }

    #[test]
    fn dispose_drops_returns() {
        let pool = BufferPool::new(64, 8);
        let block = pool.take();
        pool.dispose();
        pool.put(block);
        assert_eq!(pool.free_blocks(), 0);
    }
}
