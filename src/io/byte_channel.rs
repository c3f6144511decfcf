use crate::error::ChannelError;
use crate::io::buffer_pool::BufferPool;
use crate::utils::CancelToken;
use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const WAIT_TICK: Duration = Duration::from_millis(25);

/// Position in the channel's segment stream: segment sequence number plus
/// a byte index within that segment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ChannelCursor {
    pub seq: u64,
    pub index: usize,
}

/// One drainable view of the channel: the sealed segments in `[begin, end)`.
pub struct OutputSlice {
    pub bufs: Vec<Bytes>,
    pub begin: ChannelCursor,
    pub end: ChannelCursor,
    pub total_bytes: usize,
}

struct Seg {
    seq: u64,
    bytes: Bytes,
}

struct ChanInner {
    segs: VecDeque<Seg>,
    tail: Option<BytesMut>,
    next_seq: u64,
    begin: ChannelCursor,
    unread: usize,
    closed: bool,
    disposed: bool,
}

impl ChanInner {
    fn seal_tail(&mut self) {
        if let Some(tail) = self.tail.take() {
            if tail.is_empty() {
                self.tail = Some(tail);
                return;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.segs.push_back(Seg {
                seq,
                bytes: tail.freeze(),
            });
        }
    }
}

/// Ordered SPSC byte stream between request processing (producer side) and
/// the output pump (consumer side), backed by pool blocks.
///
/// The producer appends into an open tail block; full blocks are sealed
/// into immutable segments. The consumer snapshots the sealed range, writes
/// it to the socket, and reports consumption so blocks recycle through the
/// pool.
pub struct OutputChannel {
    inner: Mutex<ChanInner>,
    readable: Condvar,
    cancel: CancelToken,
    pool: Arc<BufferPool>,
}

impl OutputChannel {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            inner: Mutex::new(ChanInner {
                segs: VecDeque::new(),
                tail: None,
                next_seq: 0,
                begin: ChannelCursor { seq: 0, index: 0 },
                unread: 0,
                closed: false,
                disposed: false,
            }),
            readable: Condvar::new(),
            cancel: CancelToken::new_root(),
            pool,
        }
    }

    /// Cooperative stop: the consumer observes this on its next wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.readable.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Producer: append `data`, sealing blocks as they fill.
    pub fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return Err(ChannelError::Disposed);
        }
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        if inner.closed {
            return Err(ChannelError::Closed);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let room = match inner.tail.as_ref() {
                Some(t) => t.capacity() - t.len(),
                None => 0,
            };
            if room == 0 {
                inner.seal_tail();
                inner.tail = Some(self.pool.take());
                continue;
            }
            let n = rest.len().min(room);
            if let Some(tail) = inner.tail.as_mut() {
                tail.extend_from_slice(&rest[..n]);
            }
            inner.unread += n;
            rest = &rest[n..];
        }

        drop(inner);
        self.readable.notify_all();
        Ok(())
    }

    /// Consumer: block until bytes are available. `Closed` means the
    /// producer finished and everything was drained.
    pub fn wait_output(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.disposed {
                return Err(ChannelError::Disposed);
            }
            if self.cancel.is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            if inner.unread > 0 {
                return Ok(());
            }
            if inner.closed {
                return Err(ChannelError::Closed);
            }
            self.readable.wait_for(&mut inner, WAIT_TICK);
        }
    }

    /// Consumer: seal the tail and take a view of everything unconsumed.
    pub fn snapshot(&self) -> Option<OutputSlice> {
        let mut inner = self.inner.lock();
        inner.seal_tail();

        let begin = inner.begin;
        let last = inner.segs.back()?;
        let end = ChannelCursor {
            seq: last.seq,
            index: last.bytes.len(),
        };

        // single-segment ranges are sized by the index delta
        let total_bytes = if begin.seq == end.seq {
            end.index - begin.index
        } else {
            let all: usize = inner.segs.iter().map(|s| s.bytes.len()).sum();
            all - begin.index
        };

        let bufs = inner
            .segs
            .iter()
            .map(|s| {
                if s.seq == begin.seq {
                    s.bytes.slice(begin.index..)
                } else {
                    s.bytes.clone()
                }
            })
            .collect();

        Some(OutputSlice {
            bufs,
            begin,
            end,
            total_bytes,
        })
    }

    /// Consumer: everything up to `end` reached the socket (or died with
    /// it); recycle the covered segments.
    pub fn consumed(&self, end: ChannelCursor) {
        let mut inner = self.inner.lock();
        loop {
            let drained = match inner.segs.front() {
                Some(front) => {
                    front.seq < end.seq || (front.seq == end.seq && end.index >= front.bytes.len())
                }
                None => false,
            };
            if !drained {
                break;
            }
            if let Some(seg) = inner.segs.pop_front() {
                let skip = if seg.seq == inner.begin.seq {
                    inner.begin.index
                } else {
                    0
                };
                inner.unread -= seg.bytes.len() - skip;
                inner.begin = ChannelCursor {
                    seq: seg.seq + 1,
                    index: 0,
                };
                self.pool.put_bytes(seg.bytes);
            }
        }
    }

    /// Producer: no further bytes will be written.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.readable.notify_all();
    }

    /// Final release: return every remaining block to the pool.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.disposed = true;
        while let Some(seg) = inner.segs.pop_front() {
            self.pool.put_bytes(seg.bytes);
        }
        if let Some(tail) = inner.tail.take() {
            self.pool.put(tail);
        }
        inner.unread = 0;
        drop(inner);
        self.readable.notify_all();
    }

    pub fn unread(&self) -> usize {
        self.inner.lock().unread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(block: usize) -> OutputChannel {
        OutputChannel::new(Arc::new(BufferPool::new(block, 16)))
    }

    #[test]
    fn write_snapshot_consume_roundtrip() {
        let ch = channel(8);
        ch.write(b"hello world, this spans blocks").unwrap();

        let slice = ch.snapshot().unwrap();
        assert_eq!(slice.total_bytes, 30);
        assert!(slice.bufs.len() > 1);

        let flat: Vec<u8> = slice.bufs.iter().flat_map(|b| b.to_vec()).collect();
        assert_eq!(&flat, b"hello world, this spans blocks");

        ch.consumed(slice.end);
        assert_eq!(ch.unread(), 0);
        assert!(ch.snapshot().is_none());
    }

    #[test]
    fn single_segment_range_sized_by_index_delta() {
        let ch = channel(64);
        ch.write(b"abc").unwrap();

        let slice = ch.snapshot().unwrap();
        assert_eq!(slice.bufs.len(), 1);
        assert_eq!(slice.begin.seq, slice.end.seq);
        assert_eq!(slice.total_bytes, slice.end.index - slice.begin.index);
        ch.consumed(slice.end);
    }

    #[test]
    fn consumed_recycles_blocks_into_pool() {
        let pool = Arc::new(BufferPool::new(8, 16));
        let ch = OutputChannel::new(pool.clone());
        ch.write(&[7u8; 24]).unwrap();

        let slice = ch.snapshot().unwrap();
        let n = slice.bufs.len();
        drop(slice.bufs);
        ch.consumed(slice.end);
        assert_eq!(pool.free_blocks(), n);
    }

    #[test]
    fn cancel_wakes_waiting_consumer() {
        let ch = Arc::new(channel(16));
        let ch2 = ch.clone();
        let join = std::thread::spawn(move || ch2.wait_output());
        std::thread::sleep(Duration::from_millis(20));
        ch.cancel();
        assert_eq!(join.join().unwrap(), Err(ChannelError::Cancelled));
    }

    #[test]
    fn close_reports_after_drain() {
        let ch = channel(16);
        ch.write(b"tail").unwrap();
        ch.close();

        assert!(ch.wait_output().is_ok());
        let slice = ch.snapshot().unwrap();
        ch.consumed(slice.end);
        assert_eq!(ch.wait_output(), Err(ChannelError::Closed));
    }

    #[test]
    fn write_after_close_is_rejected() {
        let ch = channel(16);
        ch.close();
        assert_eq!(ch.write(b"x"), Err(ChannelError::Closed));
    }
}
