use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply clonable liveness flag shared across threads.
/// Wraps an `AtomicBool` in `Arc<CachePadded<...>>` to avoid false sharing
/// between the loop thread and pump workers.
#[derive(Clone)]
#[repr(transparent)]
pub struct HealthFlag(Arc<CachePadded<AtomicBool>>);

impl HealthFlag {
    /// Create a new flag with the given initial value.
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    /// Current value with Acquire ordering.
    #[inline(always)]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Store a value with Release ordering.
    #[inline(always)]
    pub fn set(&self, v: bool) {
        self.0.store(v, Ordering::Release)
    }

    /// Mark as live.
    #[inline(always)]
    pub fn up(&self) {
        self.set(true);
    }

    /// Mark as down.
    #[inline(always)]
    pub fn down(&self) {
        self.set(false);
    }
}

impl fmt::Debug for HealthFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthFlag")
            .field("value", &self.get())
            .finish()
    }
}
