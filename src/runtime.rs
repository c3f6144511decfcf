use crate::config::LoopConfig;
use crate::control::work::{CloseItem, Completion, CompletionWaiter, WorkItem};
use crate::error::LoopError;
use crate::io::buffer_pool::BufferPool;
use crate::net::manager::ConnectionManager;
use crate::reactor::{LoopCtx, LoopShared};
use crate::utils::{AppLifetime, NullLifetime, TaskPool, try_pin_core};
use anyhow::{Context, anyhow};
use mio::Events;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Cloneable producer-side handle to the loop thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Enqueue fire-and-forget work. Wait-free on the producer apart from
    /// the posted-flag CAS. An error from the item is fatal to the loop.
    pub fn post<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static,
    {
        self.post_item(WorkItem::new(Box::new(f), None))
    }

    /// Enqueue work with completion notification. The completion resolves
    /// via the task pool; the loop thread never runs waiter wakeups inline.
    pub fn post_waitable<F>(&self, f: F) -> Result<CompletionWaiter, LoopError>
    where
        F: FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static,
    {
        let (completion, waiter) = Completion::pair();
        self.post_item(WorkItem::new(Box::new(f), Some(completion)))?;
        Ok(waiter)
    }

    fn post_item(&self, item: WorkItem) -> Result<(), LoopError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(LoopError::Disposed);
        }
        if !self.shared.ready.load(Ordering::Acquire) {
            return Err(LoopError::NotReady);
        }
        self.shared.work.push(item);
        self.shared.signal();
        Ok(())
    }

    /// Defer a handle close to the loop thread and wake it.
    pub fn queue_close<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static,
    {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(LoopError::Disposed);
        }
        self.shared.close.push(CloseItem::new(Box::new(f)));
        self.shared.signal();
        Ok(())
    }

    /// Enqueue-only close variant, safe from drop glue: no wake, no error.
    /// The next wake or the closing pass picks the item up.
    pub fn queue_close_async<F>(&self, f: F)
    where
        F: FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static,
    {
        if self.shared.disposed.load(Ordering::Acquire) {
            return;
        }
        self.shared.close.push(CloseItem::new(Box::new(f)));
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }
}

/// Controller for the dedicated loop thread.
///
/// Owns startup, the staged shutdown sequence, and the pools shared with
/// connections. All socket I/O funnels through the thread this spawns.
pub struct LoopThread {
    cfg: LoopConfig,
    shared: Arc<LoopShared>,
    connections: Arc<ConnectionManager>,
    buffer_pool: Arc<BufferPool>,
    join: Option<thread::JoinHandle<()>>,
    term: Option<CompletionWaiter>,
}

impl LoopThread {
    pub fn new(cfg: LoopConfig) -> anyhow::Result<Self> {
        Self::with_lifetime(cfg, Arc::new(NullLifetime))
    }

    pub fn with_lifetime(cfg: LoopConfig, lifetime: Arc<dyn AppLifetime>) -> anyhow::Result<Self> {
        let pool = TaskPool::new(cfg.pool_workers.unwrap_or(2))?;
        let block_size = cfg.block_size.unwrap_or(4096);
        let max_blocks = cfg.max_pooled_blocks.unwrap_or(256);

        Ok(Self {
            cfg,
            shared: Arc::new(LoopShared::new(pool, lifetime)),
            connections: Arc::new(ConnectionManager::new()),
            buffer_pool: Arc::new(BufferPool::new(block_size, max_blocks)),
            join: None,
            term: None,
        })
    }

    #[inline]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[inline]
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// The captured fatal error, if the loop died on one.
    pub fn fatal_error(&self) -> Option<Arc<anyhow::Error>> {
        self.shared.fatal()
    }

    /// Spawn the loop thread and block until its reactor and wake primitive
    /// are initialized. On failure no further operations are valid.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.join.is_some() {
            anyhow::bail!("loop thread already started");
        }

        let (init, init_waiter) = Completion::pair();
        let (term, term_waiter) = Completion::pair();

        let shared = self.shared.clone();
        let core_id = self.cfg.core_id;
        let events_capacity = self.cfg.events_capacity.unwrap_or(256);

        let join = thread::Builder::new()
            .name("looprt-loop".into())
            .spawn(move || loop_main(shared, core_id, events_capacity, init, term))
            .context("failed to spawn loop thread")?;
        self.join = Some(join);
        self.term = Some(term_waiter);

        match init_waiter.wait(None) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                self.term = None;
                Err(anyhow!(e).context("loop thread failed to initialize"))
            }
        }
    }

    /// Three-phase shutdown, each phase bounded by `timeout / 3`:
    /// unreference the waker, then dispose every non-wake handle, then
    /// force the reactor out (leaking deliberately). Preceded by draining
    /// live connections and retiring the pools. A captured fatal error is
    /// rethrown to the caller.
    pub fn stop(&mut self, timeout: Duration) -> anyhow::Result<()> {
        {
            // never-started instances skip shutdown entirely
            let ready = self.shared.startup.lock();
            if !*ready {
                return Ok(());
            }
        }
        let handle = self.handle();

        // pre-stop: drain connections, then retire the pools
        let shutdown_timeout = Duration::from_secs(self.cfg.shutdown_timeout_secs.unwrap_or(5));
        if !self.connections.walk_and_close_all(shutdown_timeout) {
            tracing::warn!(
                timeout = ?shutdown_timeout,
                "[LoopThread] not all connections closed gracefully"
            );
        }
        swallow_disposed(handle.post(|ctx| {
            let pooled = ctx.write_pool.len();
            ctx.write_pool.dispose();
            tracing::debug!(pooled, "[LoopThread] write pool disposed");
            Ok(())
        }))?;
        self.buffer_pool.dispose();

        let step = timeout / 3;
        let Some(term) = self.term.as_ref() else {
            return Ok(());
        };
        let terminated = |res: Result<(), LoopError>| !matches!(res, Err(LoopError::Timeout));

        // Phase 1: let the reactor exit once nothing else references it.
        swallow_disposed(handle.post(|ctx| {
            ctx.unreference_waker();
            Ok(())
        }))?;
        let mut stopped = terminated(term.wait(Some(step)));

        if !stopped {
            // Phase 2: ask every non-wake handle to close.
            tracing::warn!("[LoopThread] graceful stop timed out; disposing handles");
            swallow_disposed(handle.post(|ctx| {
                ctx.dispose_all_handles();
                Ok(())
            }))?;
            stopped = terminated(term.wait(Some(step)));
        }

        if !stopped {
            // Phase 3: bounded shutdown beats clean teardown.
            tracing::warn!("[LoopThread] rude stop timed out; stopping immediately");
            swallow_disposed(handle.post(|ctx| {
                ctx.set_stop_immediate();
                Ok(())
            }))?;
            stopped = terminated(term.wait(Some(step)));
        }

        if stopped {
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
            self.shared.drain_dead();
        } else {
            tracing::error!("[LoopThread] loop thread failed to terminate");
        }

        if let Some(err) = self.shared.fatal() {
            return Err(anyhow!(LoopError::Failed(err)));
        }
        Ok(())
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.handle().post(|ctx| {
                ctx.unreference_waker();
                Ok(())
            });
        }
    }
}

fn swallow_disposed(res: Result<(), LoopError>) -> anyhow::Result<()> {
    match res {
        // the loop terminated between phases; fall through to the wait
        Ok(()) | Err(LoopError::Disposed) => Ok(()),
        Err(e) => Err(anyhow!(e)),
    }
}

fn loop_main(
    shared: Arc<LoopShared>,
    core_id: Option<usize>,
    events_capacity: usize,
    init: Completion,
    term: Completion,
) {
    // resolves the termination completion on every exit path
    let _term = TermGuard {
        completion: Some(term),
        shared: shared.clone(),
    };

    if let Some(core_id) = core_id {
        match try_pin_core(core_id) {
            Ok(core_id) => tracing::info!("[LoopThread] pinned to core: {}", core_id),
            Err(e) => {
                tracing::error!("[LoopThread] cannot pin core: {}", e);
                init.resolve(Err(e));
                return;
            }
        }
    }

    let mut events = Events::with_capacity(events_capacity);

    let mut ctx = {
        let mut ready = shared.startup.lock();
        match LoopCtx::init(shared.clone()) {
            Ok(ctx) => {
                *ready = true;
                shared.ready.store(true, Ordering::Release);
                drop(ready);
                init.resolve(Ok(()));
                ctx
            }
            Err(e) => {
                drop(ready);
                tracing::error!("[LoopThread] init failed: {e:#}");
                init.resolve(Err(e));
                return;
            }
        }
    };

    tracing::debug!("[LoopThread] reactor loop started");

    let run_res = ctx.run(&mut events);

    // no new posts once the reactor stops polling; the closing pass drains
    // everything accepted up to this point
    shared.disposed.store(true, Ordering::Release);

    match run_res {
        Ok(true) => {
            // stop-immediate: leak handles in exchange for bounded shutdown
            tracing::warn!("[LoopThread] stopped immediately; skipping close pass");
        }
        Ok(false) => {
            if let Err(e) = ctx.closing_pass() {
                tracing::error!("[LoopThread] close pass failed: {e:#}");
                shared.capture_fatal(e);
                shared.lifetime.request_stop();
            }
        }
        Err(e) => {
            tracing::error!("[LoopThread] reactor failed: {e:#}");
            shared.capture_fatal(e);
            shared.lifetime.request_stop();
        }
    }

    tracing::debug!("[LoopThread] reactor loop stopped");
}

struct TermGuard {
    completion: Option<Completion>,
    shared: Arc<LoopShared>,
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::Release);
        if let Some(c) = self.completion.take() {
            c.resolve(Ok(()));
        }
    }
}
