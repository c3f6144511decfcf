// error.rs
use std::sync::Arc;
use std::{error::Error, fmt};

const ERR_MSG_NOT_READY: &str = "loop thread has not been started";
const ERR_MSG_DISPOSED: &str = "loop thread is disposed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_CANCELLED: &str = "operation cancelled";
const ERR_MSG_CLOSED: &str = "channel is closed";
const ERR_MSG_CHAN_DISPOSED: &str = "channel is disposed";

/// Errors surfaced by the loop controller: posting work, waiting on
/// completions, stopping the thread.
#[derive(Debug, Clone)]
pub enum LoopError {
    /// The loop thread was never started.
    NotReady,
    /// The loop thread has terminated; no further operations are valid.
    Disposed,
    /// A bounded wait expired.
    Timeout,
    /// A work item failed; the error is shared because the same value may
    /// be observed by a completion waiter and by `stop`.
    Failed(Arc<anyhow::Error>),
}

impl fmt::Display for LoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopError::NotReady => write!(f, "{ERR_MSG_NOT_READY}"),
            LoopError::Disposed => write!(f, "{ERR_MSG_DISPOSED}"),
            LoopError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            LoopError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl Error for LoopError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoopError::Failed(e) => Some((**e).as_ref()),
            _ => None,
        }
    }
}

/// Errors surfaced by the output byte channel and the pump mailbox.
#[derive(Debug, Eq, PartialEq)]
pub enum ChannelError {
    /// The channel was cancelled (cooperative pump stop).
    Cancelled,
    /// The producer finished and all bytes were drained, or the peer half
    /// of the mailbox is gone.
    Closed,
    /// The channel was disposed and its blocks returned to the pool.
    Disposed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            ChannelError::Closed => write!(f, "{ERR_MSG_CLOSED}"),
            ChannelError::Disposed => write!(f, "{ERR_MSG_CHAN_DISPOSED}"),
        }
    }
}

impl Error for ChannelError {}
