pub use crate::config::{LoopConfig, MAX_LOOPS, MAX_POOLED_WRITE_REQS};
pub use crate::control::work::{Completion, CompletionWaiter};
pub use crate::error::{ChannelError, LoopError};
pub use crate::io::buffer_pool::BufferPool;
pub use crate::io::byte_channel::{ChannelCursor, OutputChannel, OutputSlice};
pub use crate::net::connection::Connection;
pub use crate::net::manager::ConnectionManager;
pub use crate::reactor::{HandleEntry, LoopCtx};
pub use crate::runtime::{LoopHandle, LoopThread};
pub use crate::utils::*;
