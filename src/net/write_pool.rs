use crate::config::MAX_POOLED_WRITE_REQS;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Reusable record describing one in-flight vectored write.
///
/// Tracks progress as (segment index, offset) so a partially-written burst
/// resumes exactly where `WouldBlock` interrupted it.
pub(crate) struct WriteReq {
    bufs: Vec<Bytes>,
    idx: usize,
    off: usize,
    total: usize,
    written: usize,
}

impl WriteReq {
    fn new() -> Self {
        Self {
            bufs: Vec::new(),
            idx: 0,
            off: 0,
            total: 0,
            written: 0,
        }
    }

    pub fn init(&mut self, bufs: Vec<Bytes>, total: usize) {
        self.bufs = bufs;
        self.idx = 0;
        self.off = 0;
        self.total = total;
        self.written = 0;
    }

    /// Unwritten remainder as I/O slices for a vectored write.
    pub fn remaining_slices(&self) -> Vec<IoSlice<'_>> {
        let mut out = Vec::with_capacity(self.bufs.len().saturating_sub(self.idx));
        for (i, buf) in self.bufs.iter().enumerate().skip(self.idx) {
            let s = if i == self.idx { &buf[self.off..] } else { &buf[..] };
            if !s.is_empty() {
                out.push(IoSlice::new(s));
            }
        }
        out
    }

    /// Account for `n` bytes accepted by the socket.
    pub fn advance(&mut self, mut n: usize) {
        self.written += n;
        while n > 0 && self.idx < self.bufs.len() {
            let left = self.bufs[self.idx].len() - self.off;
            if n < left {
                self.off += n;
                return;
            }
            n -= left;
            self.idx += 1;
            self.off = 0;
        }
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.total
    }

    pub fn reset(&mut self) {
        self.bufs.clear();
        self.idx = 0;
        self.off = 0;
        self.total = 0;
        self.written = 0;
    }
}

/// FIFO pool of write requests, loop-thread only.
///
/// `take` pops or constructs; `put` retains up to [`MAX_POOLED_WRITE_REQS`]
/// and drops the rest. After `dispose`, `put` becomes a sink so a pump that
/// finishes late leaks nothing.
pub(crate) struct WriteReqPool {
    reqs: VecDeque<WriteReq>,
    disposed: bool,
}

impl WriteReqPool {
    pub fn new() -> Self {
        Self {
            reqs: VecDeque::new(),
            disposed: false,
        }
    }

    pub fn take(&mut self) -> WriteReq {
        self.reqs.pop_front().unwrap_or_else(WriteReq::new)
    }

    pub fn put(&mut self, mut req: WriteReq) {
        req.reset();
        if !self.disposed && self.reqs.len() < MAX_POOLED_WRITE_REQS {
            self.reqs.push_back(req);
        }
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        self.reqs.clear();
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_walks_segments() {
        let mut req = WriteReq::new();
        req.init(
            vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")],
            8,
        );

        req.advance(3);
        assert!(!req.is_done());
        let slices = req.remaining_slices();
        assert_eq!(&*slices[0], b"d");
        assert_eq!(&*slices[1], b"efgh");

        req.advance(5);
        assert!(req.is_done());
        assert!(req.remaining_slices().is_empty());
    }

    #[test]
    fn pool_recycles_and_caps() {
        let mut pool = WriteReqPool::new();
        let req = pool.take();
        pool.put(req);
        assert_eq!(pool.len(), 1);

        let again = pool.take();
        assert_eq!(pool.len(), 0);
        pool.put(again);
    }

    #[test]
    fn disposed_pool_drops_returns() {
        let mut pool = WriteReqPool::new();
        let req = pool.take();
        pool.dispose();
        pool.put(req);
        assert_eq!(pool.len(), 0);
    }
}
