use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Seam to the hosting application's lifetime.
///
/// The loop thread calls [`request_stop`](AppLifetime::request_stop) when it
/// captures a fatal error, so the application can begin an orderly shutdown
/// instead of limping along without its transport.
pub trait AppLifetime: Send + Sync + 'static {
    fn request_stop(&self);
}

/// No-op lifetime for embedders that watch the loop some other way.
#[derive(Debug, Default)]
pub struct NullLifetime;

impl AppLifetime for NullLifetime {
    fn request_stop(&self) {}
}

/// Lifetime backed by a termination flag that is also raised by TERM
/// signals, so signal-driven and fatal-error shutdown share one path.
pub struct SignalLifetime {
    term: Arc<AtomicBool>,
}

impl SignalLifetime {
    pub fn register() -> anyhow::Result<Self> {
        let term = Arc::new(AtomicBool::new(false));

        for sig in TERM_SIGNALS {
            flag::register(*sig, term.clone())?;
        }

        Ok(Self { term })
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.term.load(Ordering::Relaxed)
    }

    /// Share the raw flag with code that polls it in its own loop.
    #[inline]
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.term.clone()
    }
}

impl AppLifetime for SignalLifetime {
    fn request_stop(&self) {
        self.term.store(true, Ordering::SeqCst);
        tracing::warn!("[AppLifetime] stop requested");
    }
}
