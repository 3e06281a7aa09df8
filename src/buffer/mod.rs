//! Reusable scratch buffers.
//!
//! A [`BufferPool`] hands out zeroed byte buffers in a few size classes so
//! the detection hot path never allocates per request. Buffers are addressed
//! by generation-tagged [`BufferHandle`]s (arena index + generation): a
//! release bumps the slot's generation, so a repeated or stale release is
//! rejected with `DoubleRelease` and never corrupts the next owner's data.
//!
//! Workers usually go through [`BufferLease`], which owns the bytes while
//! held and returns them on drop:
//!
//! ```rust,ignore
//! let pool = Arc::new(BufferPool::new(BufferPoolConfig::default())?);
//! let mut scratch = pool.lease(content.len()).await?;
//! let n = normalize_into(content, &mut scratch).unwrap_or(0);
//! // scratch goes back to the pool here
//! ```

mod lease;
mod pool;

pub use lease::BufferLease;
pub use pool::{BufferHandle, BufferPool};

use serde::Serialize;

/// Buffer pool counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Buffers currently backed by memory
    pub allocated: usize,
    /// Allocated buffers on a free list
    pub free: usize,
    /// Buffers checked out
    pub in_use: usize,
    /// High-water mark of `in_use`
    pub peak_usage: usize,
    /// Configured ceiling
    pub max_buffers: usize,
    /// Successful acquires
    pub acquires: u64,
    /// Successful releases
    pub releases: u64,
    /// Releases rejected as stale or repeated
    pub rejected_releases: u64,
    /// Acquires that failed at the ceiling
    pub exhausted_count: u64,
    /// Shrink passes that reclaimed memory
    pub shrinks: u64,
}
