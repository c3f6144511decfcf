use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hierarchical cancellation token.
///
/// Cheap to clone and check. Cancelling a token trips it and every token
/// derived from it via [`new_child`](CancelToken::new_child); cancelling a
/// child never affects the parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    tripped: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// Create a root token with no parent.
    #[inline]
    pub fn new_root() -> Self {
        Self {
            inner: Arc::new(Inner {
                tripped: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Derive a child token linked to this one.
    #[inline]
    pub fn new_child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                tripped: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Trip this token and, transitively, all of its children.
    #[inline]
    pub fn cancel(&self) {
        self.inner.tripped.store(true, Ordering::Release);
    }

    /// Whether this token or any ancestor has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        let mut cur = self;
        loop {
            if cur.inner.tripped.load(Ordering::Acquire) {
                return true;
            }
            match cur.inner.parent.as_ref() {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}
