//! Size-classed buffer arena with generation-tagged handles.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BufferLease, BufferStats};
use crate::config::{BufferPoolConfig, ExhaustionPolicy};
use crate::error::{GateError, Result};

/// Identifies one checked-out buffer.
///
/// Handles are plain values: copying one does not copy the buffer. A handle
/// is only good until its buffer is released, after which the slot's
/// generation moves on and the handle is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: usize,
    generation: u64,
    len: usize,
}

impl BufferHandle {
    /// Arena slot index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation the handle was issued at
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffer length in bytes (the size class)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    InUse,
    /// Bytes moved out to a [`BufferLease`]; only the lease may release it
    Leased,
    /// Released, bytes being zeroed outside the arena lock
    Zeroing,
    /// Memory returned by shrink or shutdown; slot reusable by any class
    Retired,
}

struct Slot {
    class: usize,
    state: SlotState,
    generation: u64,
    data: Arc<Mutex<Box<[u8]>>>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<Vec<usize>>,
    retired: Vec<usize>,
    allocated: usize,
    allocated_per_class: Vec<usize>,
    in_use: usize,
    peak_usage: usize,
    low_checks: u32,
    shut_down: bool,
    acquires: u64,
    releases: u64,
    rejected_releases: u64,
    exhausted: u64,
    shrinks: u64,
}

/// Pool of reusable, zeroed scratch buffers.
///
/// Buffers come in the configured size classes. `acquire` returns the
/// smallest class that fits, growing the arena up to `max_buffers`; at the
/// ceiling it fails with `PoolExhausted` or, under
/// [`ExhaustionPolicy::Wait`], waits for a release. Utilization is sampled on
/// every release and by [`BufferPool::maintain`]; after
/// `shrink_after_checks` consecutive low samples free buffers beyond
/// `min_buffers` per class are dropped.
pub struct BufferPool {
    config: BufferPoolConfig,
    arena: Mutex<Arena>,
    released: Notify,
}

impl BufferPool {
    /// Create, preallocating `min_buffers` per size class
    pub fn new(config: BufferPoolConfig) -> Result<Self> {
        if config.size_classes.is_empty() || config.max_buffers == 0 {
            return Err(GateError::Config(
                "buffer pool needs at least one size class and max_buffers > 0".into(),
            ));
        }

        let classes = config.size_classes.len();
        let mut arena = Arena {
            slots: Vec::new(),
            free: vec![Vec::new(); classes],
            retired: Vec::new(),
            allocated: 0,
            allocated_per_class: vec![0; classes],
            in_use: 0,
            peak_usage: 0,
            low_checks: 0,
            shut_down: false,
            acquires: 0,
            releases: 0,
            rejected_releases: 0,
            exhausted: 0,
            shrinks: 0,
        };

        for class in 0..classes {
            for _ in 0..config.min_buffers {
                if arena.allocated >= config.max_buffers {
                    break;
                }
                let index = Self::allocate(&mut arena, class, config.size_classes[class]);
                arena.free[class].push(index);
            }
        }

        tracing::debug!(
            classes = ?config.size_classes,
            preallocated = arena.allocated,
            max = config.max_buffers,
            "buffer pool ready"
        );

        Ok(Self {
            config,
            arena: Mutex::new(arena),
            released: Notify::new(),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Smallest size class holding `min_len` bytes
    pub fn size_class_for(&self, min_len: usize) -> Option<usize> {
        self.config.size_classes.iter().position(|&len| len >= min_len)
    }

    fn allocate(arena: &mut Arena, class: usize, len: usize) -> usize {
        let data = Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice()));
        arena.allocated += 1;
        arena.allocated_per_class[class] += 1;

        if let Some(index) = arena.retired.pop() {
            let slot = &mut arena.slots[index];
            slot.class = class;
            slot.state = SlotState::Free;
            slot.data = data;
            index
        } else {
            arena.slots.push(Slot {
                class,
                state: SlotState::Free,
                generation: 0,
                data,
            });
            arena.slots.len() - 1
        }
    }

    fn retire(arena: &mut Arena, index: usize) {
        let slot = &mut arena.slots[index];
        let class = slot.class;
        slot.state = SlotState::Retired;
        slot.generation += 1;
        slot.data = Arc::new(Mutex::new(Box::default()));
        arena.allocated -= 1;
        arena.allocated_per_class[class] -= 1;
        arena.retired.push(index);
    }

    /// Check out a zeroed buffer of at least `min_len` bytes. Never blocks.
    pub fn acquire(&self, min_len: usize) -> Result<BufferHandle> {
        let class = self.size_class_for(min_len).ok_or(GateError::BufferTooLarge {
            requested: min_len,
            largest: self.config.largest_class(),
        })?;
        let len = self.config.size_classes[class];

        let mut arena = self.arena.lock();
        if arena.shut_down {
            return Err(GateError::ShuttingDown("buffer pool"));
        }

        let index = match arena.free[class].pop() {
            Some(index) => index,
            None if arena.allocated < self.config.max_buffers => {
                Self::allocate(&mut arena, class, len)
            },
            None => {
                // At the ceiling: trade an idle buffer of another class for one of this class
                let donor = (0..arena.free.len()).find(|&c| c != class && !arena.free[c].is_empty());
                match donor.and_then(|c| arena.free[c].pop()) {
                    Some(idle) => {
                        Self::retire(&mut arena, idle);
                        Self::allocate(&mut arena, class, len)
                    },
                    None => {
                        arena.exhausted += 1;
                        return Err(GateError::PoolExhausted {
                            in_use: arena.in_use,
                            max_buffers: self.config.max_buffers,
                        });
                    },
                }
            },
        };

        let slot = &mut arena.slots[index];
        slot.state = SlotState::InUse;
        let generation = slot.generation;

        arena.in_use += 1;
        arena.peak_usage = arena.peak_usage.max(arena.in_use);
        arena.acquires += 1;

        Ok(BufferHandle {
            index,
            generation,
            len,
        })
    }

    /// Like [`acquire`](Self::acquire), but under [`ExhaustionPolicy::Wait`]
    /// waits up to `acquire_timeout_ms` for a release before failing.
    pub async fn acquire_async(&self, min_len: usize) -> Result<BufferHandle> {
        if self.config.exhaustion == ExhaustionPolicy::Fail {
            return self.acquire(min_len);
        }

        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout();
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed
            released.as_mut().enable();

            match self.acquire(min_len) {
                Err(GateError::PoolExhausted { .. }) => {},
                other => return other,
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.acquire(min_len);
            }
        }
    }

    /// Acquire wrapped in an RAII lease that releases on drop
    pub async fn lease(self: &Arc<Self>, min_len: usize) -> Result<BufferLease> {
        let handle = self.acquire_async(min_len).await?;
        Ok(BufferLease::new(Arc::clone(self), handle))
    }

    fn validate(
        arena: &Arena,
        handle: &BufferHandle,
        expected: SlotState,
    ) -> std::result::Result<(), u64> {
        match arena.slots.get(handle.index) {
            Some(slot) if slot.state == expected && slot.generation == handle.generation => Ok(()),
            Some(slot) => Err(slot.generation),
            None => Err(0),
        }
    }

    /// Return a buffer. Stale or repeated releases, and releases of a
    /// handle whose bytes are out on a [`BufferLease`], fail with
    /// `DoubleRelease` and leave the pool untouched.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        self.release_from(handle, SlotState::InUse, None)
    }

    /// Lease-side release: put the bytes back and free the slot
    pub(super) fn release_leased(&self, handle: BufferHandle, bytes: Box<[u8]>) -> Result<()> {
        self.release_from(handle, SlotState::Leased, Some(bytes))
    }

    fn release_from(
        &self,
        handle: BufferHandle,
        expected: SlotState,
        bytes: Option<Box<[u8]>>,
    ) -> Result<()> {
        let data = {
            let mut arena = self.arena.lock();
            if let Err(current) = Self::validate(&arena, &handle, expected) {
                arena.rejected_releases += 1;
                drop(arena);
                tracing::warn!(
                    index = handle.index,
                    presented = handle.generation,
                    current,
                    "rejected buffer release"
                );
                return Err(GateError::DoubleRelease {
                    index: handle.index,
                    presented: handle.generation,
                    current,
                });
            }

            let slot = &mut arena.slots[handle.index];
            slot.generation += 1;
            slot.state = SlotState::Zeroing;
            Arc::clone(&slot.data)
        };

        {
            let mut data = data.lock();
            if let Some(bytes) = bytes {
                *data = bytes;
            }
            data.fill(0);
        }

        {
            let mut arena = self.arena.lock();
            let slot = &mut arena.slots[handle.index];
            let class = slot.class;
            arena.in_use -= 1;
            arena.releases += 1;
            if arena.shut_down {
                Self::retire(&mut arena, handle.index);
            } else {
                arena.slots[handle.index].state = SlotState::Free;
                arena.free[class].push(handle.index);
                self.sample_utilization(&mut arena);
            }
        }

        self.released.notify_waiters();
        Ok(())
    }

    fn live_data(&self, handle: &BufferHandle) -> Result<Arc<Mutex<Box<[u8]>>>> {
        let arena = self.arena.lock();
        match Self::validate(&arena, handle, SlotState::InUse) {
            Ok(()) => Ok(Arc::clone(&arena.slots[handle.index].data)),
            Err(current) => Err(GateError::StaleHandle {
                index: handle.index,
                presented: handle.generation,
                current,
            }),
        }
    }

    /// Run `f` over the bytes behind a live handle.
    pub fn with_buffer<R>(&self, handle: &BufferHandle, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let data = self.live_data(handle)?;
        let mut bytes = data.lock();
        Ok(f(&mut bytes[..]))
    }

    /// Move the bytes out for exclusive use by a lease. The slot is marked
    /// `Leased` and holds an empty placeholder until
    /// [`release_leased`](Self::release_leased).
    pub(super) fn take_bytes(&self, handle: &BufferHandle) -> Result<Box<[u8]>> {
        let data = {
            let mut arena = self.arena.lock();
            if let Err(current) = Self::validate(&arena, handle, SlotState::InUse) {
                return Err(GateError::StaleHandle {
                    index: handle.index,
                    presented: handle.generation,
                    current,
                });
            }
            let slot = &mut arena.slots[handle.index];
            slot.state = SlotState::Leased;
            Arc::clone(&slot.data)
        };
        let bytes = std::mem::take(&mut *data.lock());
        Ok(bytes)
    }

    fn sample_utilization(&self, arena: &mut Arena) {
        if arena.allocated == 0 {
            return;
        }
        let utilization = arena.in_use as f64 / arena.allocated as f64;
        if utilization >= self.config.low_utilization {
            arena.low_checks = 0;
            return;
        }

        arena.low_checks += 1;
        if arena.low_checks < self.config.shrink_after_checks {
            return;
        }
        arena.low_checks = 0;

        let mut reclaimed = 0;
        for class in 0..arena.free.len() {
            while arena.allocated_per_class[class] > self.config.min_buffers {
                let Some(index) = arena.free[class].pop() else {
                    break;
                };
                Self::retire(arena, index);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            arena.shrinks += 1;
            tracing::debug!(reclaimed, allocated = arena.allocated, "buffer pool shrank");
        }
    }

    /// Take one utilization sample; called periodically by the sweeper so
    /// an idle pool still shrinks.
    pub fn maintain(&self) {
        let mut arena = self.arena.lock();
        if !arena.shut_down {
            self.sample_utilization(&mut arena);
        }
    }

    /// Free every idle buffer and refuse further acquires. Buffers still
    /// checked out are freed as they come back.
    pub fn shutdown(&self) {
        let mut arena = self.arena.lock();
        if arena.shut_down {
            return;
        }
        arena.shut_down = true;
        for class in 0..arena.free.len() {
            while let Some(index) = arena.free[class].pop() {
                Self::retire(&mut arena, index);
            }
        }
        tracing::info!(outstanding = arena.in_use, "buffer pool shut down");
        drop(arena);
        self.released.notify_waiters();
    }

    /// Counters snapshot
    pub fn stats(&self) -> BufferStats {
        let arena = self.arena.lock();
        BufferStats {
            allocated: arena.allocated,
            free: arena.free.iter().map(Vec::len).sum(),
            in_use: arena.in_use,
            peak_usage: arena.peak_usage,
            max_buffers: self.config.max_buffers,
            acquires: arena.acquires,
            releases: arena.releases,
            rejected_releases: arena.rejected_releases,
            exhausted_count: arena.exhausted,
            shrinks: arena.shrinks,
        }
    }
}
