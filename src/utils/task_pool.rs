use anyhow::Context;
use crossbeam::channel as cbchan;
use std::thread;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads for user-facing continuations.
///
/// The loop thread hands completion resolutions to this pool so that it
/// never runs arbitrary waiter wakeups (or their follow-on work) inline.
pub struct TaskPool {
    tx: Option<cbchan::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = cbchan::unbounded::<Job>();

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("looprt-pool-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .with_context(|| format!("failed to spawn pool worker {i}"))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    /// Run `job` on a pool worker. Dropped silently if the pool is shut down.
    #[inline]
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // closing the channel lets workers drain and exit
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
