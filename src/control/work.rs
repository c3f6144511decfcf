use crate::error::LoopError;
use crate::reactor::LoopCtx;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub(crate) type WorkFn = Box<dyn FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static>;
pub(crate) type CloseFn = Box<dyn FnOnce(&mut LoopCtx) -> anyhow::Result<()> + Send + 'static>;

/// Unit of cross-thread work. Created on any thread, consumed exactly once
/// on the loop thread. Items without a completion fail the loop on error;
/// items with one report the error there instead.
pub(crate) struct WorkItem {
    pub callback: WorkFn,
    pub completion: Option<Completion>,
}

impl WorkItem {
    #[inline]
    pub fn new(callback: WorkFn, completion: Option<Completion>) -> Self {
        Self {
            callback,
            completion,
        }
    }
}

/// Handle-destruction unit deferred to the loop thread. Errors raised by a
/// close callback are fatal to the loop.
pub(crate) struct CloseItem {
    pub callback: CloseFn,
}

impl CloseItem {
    #[inline]
    pub fn new(callback: CloseFn) -> Self {
        Self { callback }
    }
}

#[derive(Clone)]
enum Outcome {
    Done,
    Failed(Arc<anyhow::Error>),
    /// The item was dropped without running (loop terminated first).
    Dropped,
}

struct CompletionState {
    slot: Mutex<Option<Outcome>>,
    cv: Condvar,
}

/// Resolver half of a one-shot completion. Held by the work item; resolves
/// exactly once, either explicitly or as `Dropped` when discarded unrun.
pub struct Completion {
    state: Option<Arc<CompletionState>>,
}

/// Waiter half of a one-shot completion.
pub struct CompletionWaiter {
    state: Arc<CompletionState>,
}

impl Completion {
    pub fn pair() -> (Completion, CompletionWaiter) {
        let state = Arc::new(CompletionState {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        });
        (
            Completion {
                state: Some(state.clone()),
            },
            CompletionWaiter { state },
        )
    }

    pub fn resolve(mut self, res: anyhow::Result<()>) {
        if let Some(state) = self.state.take() {
            let outcome = match res {
                Ok(()) => Outcome::Done,
                Err(e) => Outcome::Failed(Arc::new(e)),
            };
            Self::finish(&state, outcome);
        }
    }

    fn finish(state: &CompletionState, outcome: Outcome) {
        let mut slot = state.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            state.cv.notify_all();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            Self::finish(&state, Outcome::Dropped);
        }
    }
}

impl CompletionWaiter {
    /// Block until the completion resolves or `timeout` expires.
    /// The outcome stays observable, so repeated waits are allowed.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), LoopError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.state.slot.lock();

        loop {
            if let Some(outcome) = slot.as_ref() {
                return match outcome {
                    Outcome::Done => Ok(()),
                    Outcome::Failed(e) => Err(LoopError::Failed(e.clone())),
                    Outcome::Dropped => Err(LoopError::Disposed),
                };
            }

            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(LoopError::Timeout);
                    }
                    self.state.cv.wait_for(&mut slot, d - now);
                }
                None => self.state.cv.wait(&mut slot),
            }
        }
    }

    /// Non-blocking check whether the completion has resolved.
    pub fn is_resolved(&self) -> bool {
        self.state.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn completion_resolves_once_and_stays_observable() {
        let (c, w) = Completion::pair();
        c.resolve(Ok(()));
        assert!(w.wait(Some(Duration::from_millis(10))).is_ok());
        assert!(w.wait(Some(Duration::from_millis(10))).is_ok());
    }

    #[test]
    fn dropped_completion_reports_disposed() {
        let (c, w) = Completion::pair();
        drop(c);
        assert!(matches!(w.wait(None), Err(LoopError::Disposed)));
    }

    #[test]
    fn waiter_times_out_then_observes_late_resolution() {
        let (c, w) = Completion::pair();
        assert!(matches!(
            w.wait(Some(Duration::from_millis(20))),
            Err(LoopError::Timeout)
        ));

        let join = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.resolve(Err(anyhow::anyhow!("boom")));
        });

        match w.wait(Some(Duration::from_secs(2))) {
            Err(LoopError::Failed(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        join.join().unwrap();
    }
}
