//! RAII scratch-buffer lease.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::{BufferHandle, BufferPool};
use crate::error::Result;

/// A checked-out buffer that goes back to its pool when dropped.
///
/// The lease moves the bytes out of the arena for its lifetime, so access
/// through `Deref`/`DerefMut` takes no locks and the lease can be held
/// across `.await` points.
pub struct BufferLease {
    pool: Arc<BufferPool>,
    handle: BufferHandle,
    bytes: Option<Box<[u8]>>,
    live: bool,
}

impl BufferLease {
    pub(super) fn new(pool: Arc<BufferPool>, handle: BufferHandle) -> Self {
        // A fresh handle is always live; an empty lease is still released on drop
        let bytes = pool.take_bytes(&handle).ok();
        Self {
            pool,
            handle,
            bytes,
            live: true,
        }
    }

    /// Underlying handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Release now and surface any error instead of logging it
    pub fn release(mut self) -> Result<()> {
        self.give_back()
    }

    fn give_back(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.live) {
            return Ok(());
        }
        match self.bytes.take() {
            Some(bytes) => self.pool.release_leased(self.handle, bytes),
            None => self.pool.release(self.handle),
        }
    }
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Err(e) = self.give_back() {
            tracing::warn!(index = self.handle.index(), "lease release failed: {e}");
        }
    }
}

impl std::fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferLease")
            .field("handle", &self.handle)
            .field("held", &self.bytes.is_some())
            .finish()
    }
}
