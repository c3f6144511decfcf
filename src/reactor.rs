use crate::config::MAX_LOOPS;
use crate::control::queues::{CloseQueue, PostedFlag, WorkQueue};
use crate::control::work::{CloseItem, WorkItem};
use crate::net::pump::PumpEvent;
use crate::net::write_pool::{WriteReq, WriteReqPool};
use crate::utils::{AppLifetime, HealthFlag, TaskPool};
use anyhow::Context;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use ringbuf::HeapProd;
use ringbuf::producer::Producer;
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use uuid::fmt::Simple;

/// Reserved token for the wake primitive; slab keys stay well below it.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// State shared between the loop thread and every producer of work.
pub(crate) struct LoopShared {
    pub work: WorkQueue,
    pub close: CloseQueue,
    pub posted: PostedFlag,
    pub waker: OnceLock<Waker>,
    /// Mirrors the ready flag for lock-free post checks.
    pub ready: AtomicBool,
    /// Set when the loop thread exits; no further operations are valid.
    pub disposed: AtomicBool,
    /// Startup mutex guarding the ready flag against `start`/`stop` races.
    pub startup: Mutex<bool>,
    fatal: Mutex<Option<Arc<anyhow::Error>>>,
    pub pool: TaskPool,
    pub lifetime: Arc<dyn AppLifetime>,
}

impl LoopShared {
    pub fn new(pool: TaskPool, lifetime: Arc<dyn AppLifetime>) -> Self {
        Self {
            work: WorkQueue::new(),
            close: CloseQueue::new(),
            posted: PostedFlag::new(),
            waker: OnceLock::new(),
            ready: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            startup: Mutex::new(false),
            fatal: Mutex::new(None),
            pool,
            lifetime,
        }
    }

    /// First captured error wins; later ones are already logged at the site.
    pub fn capture_fatal(&self, e: anyhow::Error) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(Arc::new(e));
        }
    }

    pub fn fatal(&self) -> Option<Arc<anyhow::Error>> {
        self.fatal.lock().clone()
    }

    /// Wake the loop iff this caller won the posted-flag CAS.
    pub fn signal(&self) {
        if self.posted.fire()
            && let Some(waker) = self.waker.get()
            && let Err(e) = waker.wake()
        {
            tracing::error!("[LoopThread] wake failed: {e}");
        }
    }

    /// Drop everything still queued. Only valid once the loop thread is
    /// gone; pending completions resolve as dropped.
    pub fn drain_dead(&self) {
        self.work.clear();
        self.close.clear();
    }
}

/// One registered native handle.
pub enum HandleEntry {
    Stream(StreamEntry),
    /// Holds the loop open without any I/O behind it.
    KeepAlive,
}

pub struct StreamEntry {
    stream: TcpStream,
    inflight: Option<WriteReq>,
    events: HeapProd<PumpEvent>,
    alive: HealthFlag,
    conn_id: Simple,
}

impl StreamEntry {
    pub fn conn_id(&self) -> Simple {
        self.conn_id
    }
}

/// Loop-thread-owned reactor state.
///
/// Work-item callbacks receive `&mut LoopCtx`; nothing here is reachable
/// from another thread, which is what keeps every handle loop-affine.
pub struct LoopCtx {
    poll: Poll,
    handles: Slab<HandleEntry>,
    pub(crate) write_pool: WriteReqPool,
    waker_referenced: bool,
    stop_immediate: bool,
    closing: VecDeque<CloseItem>,
    shared: Arc<LoopShared>,
}

impl LoopCtx {
    pub(crate) fn init(shared: Arc<LoopShared>) -> anyhow::Result<Self> {
        let poll = Poll::new().context("failed to create reactor poll")?;
        let waker =
            Waker::new(poll.registry(), WAKE_TOKEN).context("failed to create wake primitive")?;
        shared
            .waker
            .set(waker)
            .map_err(|_| anyhow::anyhow!("wake primitive already initialized"))?;

        Ok(Self {
            poll,
            handles: Slab::new(),
            write_pool: WriteReqPool::new(),
            waker_referenced: true,
            stop_immediate: false,
            closing: VecDeque::new(),
            shared,
        })
    }

    /// Run until no referenced handle remains. Returns true iff the loop
    /// was told to stop immediately instead of draining.
    pub(crate) fn run(&mut self, events: &mut Events) -> anyhow::Result<bool> {
        // anything enqueued before the wake primitive existed is drained
        // here, which also re-arms the posted flag
        self.on_wake()?;

        loop {
            if self.stop_immediate {
                return Ok(true);
            }
            if !self.has_referenced_handles() {
                return Ok(false);
            }

            if let Err(e) = self.poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(anyhow::Error::from(e).context("reactor poll failed"));
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.on_wake()?;
                } else if event.is_writable() {
                    self.drive_write(event.token().0);
                }
            }
        }
    }

    fn has_referenced_handles(&self) -> bool {
        self.waker_referenced || !self.handles.is_empty()
    }

    /// Sole work-drain entry point: re-arm the posted flag, then drain both
    /// queues for up to [`MAX_LOOPS`] rounds so one task's write burst
    /// cannot starve the reactor.
    fn on_wake(&mut self) -> anyhow::Result<()> {
        self.shared.posted.disarm();

        // consecutive drains retire opposite work buffers, so only two empty
        // rounds in a row prove both sides were empty
        let mut idle_rounds = 0;
        for _ in 0..MAX_LOOPS {
            let worked = self.drain_work()?;
            let closed = self.drain_close()?;
            if worked == 0 && closed == 0 {
                idle_rounds += 1;
                if idle_rounds >= 2 {
                    break;
                }
            } else {
                idle_rounds = 0;
            }
        }

        if idle_rounds < 2 {
            // cap reached before both sides were seen empty; take one
            // reactor tick and resume instead of starving other events
            self.shared.signal();
        }
        Ok(())
    }

    fn drain_work(&mut self) -> anyhow::Result<usize> {
        let shared = self.shared.clone();
        let queue = shared.work.swap();

        let mut n = 0;
        while let Some(item) = queue.pop() {
            n += 1;
            let WorkItem {
                callback,
                completion,
            } = item;
            match (callback(self), completion) {
                (Ok(()), None) => {}
                (Ok(()), Some(c)) => shared.pool.execute(move || c.resolve(Ok(()))),
                (Err(e), Some(c)) => shared.pool.execute(move || c.resolve(Err(e))),
                (Err(e), None) => {
                    tracing::error!("[LoopThread] work item failed: {e:#}");
                    return Err(e);
                }
            }
        }
        Ok(n)
    }

    fn drain_close(&mut self) -> anyhow::Result<usize> {
        let mut running = std::mem::take(&mut self.closing);
        let shared = self.shared.clone();
        shared.close.swap_into(&mut running);

        let n = running.len();
        while let Some(item) = running.pop_front() {
            if let Err(e) = (item.callback)(self) {
                tracing::error!("[LoopThread] close callback failed: {e:#}");
                return Err(e);
            }
        }
        self.closing = running;
        Ok(n)
    }

    // ---- handle registry ----

    pub(crate) fn register_stream(
        &mut self,
        mut stream: TcpStream,
        conn_id: Simple,
        alive: HealthFlag,
        events: HeapProd<PumpEvent>,
    ) -> anyhow::Result<usize> {
        let entry = self.handles.vacant_entry();
        let tok = entry.key();
        self.poll
            .registry()
            .register(&mut stream, Token(tok), Interest::WRITABLE)
            .context("failed to register stream with the reactor")?;
        entry.insert(HandleEntry::Stream(StreamEntry {
            stream,
            inflight: None,
            events,
            alive,
            conn_id,
        }));
        Ok(tok)
    }

    /// Keep the loop referenced without any I/O behind it.
    pub fn register_keep_alive(&mut self) -> usize {
        self.handles.insert(HandleEntry::KeepAlive)
    }

    /// Dispose one handle: deregister, fail any in-flight write, close.
    pub fn dispose_handle(&mut self, token: usize) {
        let Some(entry) = self.handles.try_remove(token) else {
            return;
        };
        if let HandleEntry::Stream(mut se) = entry {
            if let Some(mut req) = se.inflight.take() {
                req.reset();
                self.write_pool.put(req);
                let _ = se.events.try_push(PumpEvent::WriteDone {
                    err: Some(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "socket handle disposed",
                    )),
                });
            }
            let _ = self.poll.registry().deregister(&mut se.stream);
            se.alive.down();
            tracing::trace!(conn = %se.conn_id, "[LoopThread] socket handle disposed");
        }
    }

    /// Visit every live handle. Only reachable on the loop thread.
    pub fn walk<F: FnMut(usize, &HandleEntry)>(&self, mut f: F) {
        for (tok, entry) in self.handles.iter() {
            f(tok, entry);
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Phase-2 shutdown: dispose everything except the wake primitive,
    /// which lives outside the registry and so cannot be aliased here.
    pub(crate) fn dispose_all_handles(&mut self) {
        let mut tokens = Vec::with_capacity(self.handles.len());
        self.walk(|tok, _| tokens.push(tok));
        for tok in tokens {
            self.dispose_handle(tok);
        }
    }

    /// Enqueue a close from the loop thread itself; a later drain round of
    /// the current wake cycle (or the closing pass) picks it up.
    pub fn defer_close<F>(&mut self, f: F)
    where
        F: FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static,
    {
        self.shared.close.push(CloseItem::new(Box::new(f)));
    }

    // ---- wake primitive ----

    pub(crate) fn reference_waker(&mut self) {
        self.waker_referenced = true;
    }

    /// Idempotent: double-unreference is a no-op.
    pub fn unreference_waker(&mut self) {
        self.waker_referenced = false;
    }

    pub(crate) fn set_stop_immediate(&mut self) {
        self.stop_immediate = true;
    }

    // ---- writes ----

    /// Take a pooled write request and start draining `bufs` to the socket.
    /// The pump is notified through its mailbox when the write settles.
    pub(crate) fn submit_write(&mut self, token: usize, bufs: Vec<Bytes>, total: usize) {
        let mut req = self.write_pool.take();
        req.init(bufs, total);

        let leftover = match self.handles.get_mut(token) {
            Some(HandleEntry::Stream(se)) if se.inflight.is_none() => {
                se.inflight = Some(req);
                None
            }
            Some(HandleEntry::Stream(se)) => {
                let _ = se.events.try_push(PumpEvent::WriteDone {
                    err: Some(io::Error::other("write already in flight")),
                });
                Some(req)
            }
            // handle gone; the pump sees the downed alive flag
            _ => Some(req),
        };

        match leftover {
            Some(req) => self.write_pool.put(req),
            None => self.drive_write(token),
        }
    }

    /// Progress the in-flight write; runs at submit time and again on every
    /// WRITABLE edge until the request settles.
    fn drive_write(&mut self, token: usize) {
        let finished: Option<(WriteReq, Option<io::Error>)> = {
            let Some(HandleEntry::Stream(se)) = self.handles.get_mut(token) else {
                return;
            };
            let Some(mut req) = se.inflight.take() else {
                return;
            };

            loop {
                if req.is_done() {
                    break Some((req, None));
                }
                let res = {
                    let slices = req.remaining_slices();
                    se.stream.write_vectored(&slices)
                };
                match res {
                    Ok(0) => {
                        break Some((
                            req,
                            Some(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "socket accepted zero bytes",
                            )),
                        ));
                    }
                    Ok(n) => req.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        se.inflight = Some(req);
                        break None;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Some((req, Some(e))),
                }
            }
        };

        if let Some((mut req, err)) = finished {
            // release buffer refs before notifying so the pump can recycle
            req.reset();
            if let Some(HandleEntry::Stream(se)) = self.handles.get_mut(token) {
                let _ = se.events.try_push(PumpEvent::WriteDone { err });
            }
            self.write_pool.put(req);
        }
    }

    // ---- half-close ----

    /// Shut down the write side of a stream and report the FIN status to
    /// the pump.
    pub(crate) fn shutdown_write(&mut self, token: usize) {
        if let Some(HandleEntry::Stream(se)) = self.handles.get_mut(token) {
            let res = se.stream.shutdown(std::net::Shutdown::Write);
            let _ = se.events.try_push(PumpEvent::FinDone {
                sent: true,
                err: res.err(),
            });
        }
    }

    // ---- teardown ----

    /// Closing pass after a natural exit: reference the waker again, route
    /// its teardown through the close queue, and drain until nothing is
    /// left. Work items accepted before the loop was marked disposed are
    /// drained here too, so a post without a completion still runs exactly
    /// once; closes enqueued by drop glue ride along naturally.
    pub(crate) fn closing_pass(&mut self) -> anyhow::Result<()> {
        self.reference_waker();
        self.shared.close.push(CloseItem::new(Box::new(|ctx: &mut LoopCtx| {
            ctx.unreference_waker();
            Ok(())
        })));

        // same two-empty-rounds rule as on_wake: consecutive drains retire
        // opposite work buffers
        let mut idle_rounds = 0;
        while idle_rounds < 2 {
            let worked = self.drain_work()?;
            let closed = self.drain_close()?;
            if worked == 0 && closed == 0 {
                idle_rounds += 1;
            } else {
                idle_rounds = 0;
            }
        }
        Ok(())
    }
}
