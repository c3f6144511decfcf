use serde::{Deserialize, Serialize};

/// Max back-to-back drain rounds per wake before control returns to the
/// reactor for one tick.
pub const MAX_LOOPS: usize = 8;

/// Cap on reusable write-request records kept by the loop.
pub const MAX_POOLED_WRITE_REQS: usize = 1024;

/// Configuration for the loop thread and its per-connection plumbing.
/// Keeps lifecycle and buffering knobs small and explicit.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoopConfig {
    /// Time allowed for closing live connections at the start of `stop`
    /// (`None` = 5 seconds).
    pub shutdown_timeout_secs: Option<u64>,

    /// Logical CPU core to pin the loop thread to (`None` = no pinning).
    pub core_id: Option<usize>,

    /// Capacity of the reactor's event buffer (`None` = 256).
    pub events_capacity: Option<usize>,

    /// Worker threads resolving completions off the loop (`None` = 2).
    pub pool_workers: Option<usize>,

    /// Size of one output buffer block in bytes (`None` = 4096).
    pub block_size: Option<usize>,

    /// Max free blocks retained by the buffer pool (`None` = 256).
    pub max_pooled_blocks: Option<usize>,
}
