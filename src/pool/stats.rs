//! Dispatcher statistics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Supervisory health of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Accepting work
    Healthy,
    /// Faulted, waiting out its respawn backoff
    Unavailable,
}

/// Per-worker counters, shared between the dispatcher and the supervisor.
#[derive(Debug)]
pub(crate) struct WorkerCounters {
    pub(crate) healthy: AtomicBool,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) completed: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) restarts: AtomicU64,
}

impl Default for WorkerCounters {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }
}

impl WorkerCounters {
    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn finish_one(&self) {
        // Saturating: a fault path and a late finish must never underflow
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn snapshot(&self, id: usize) -> WorkerStats {
        WorkerStats {
            id,
            health: if self.is_healthy() {
                WorkerHealth::Healthy
            } else {
                WorkerHealth::Unavailable
            },
            in_flight: self.in_flight(),
            completed: self.completed.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

/// Pool-wide task totals by outcome.
#[derive(Debug, Default)]
pub(crate) struct TaskTotals {
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) redispatched: AtomicU64,
}

impl TaskTotals {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One worker's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Worker index
    pub id: usize,
    /// Supervisory state
    pub health: WorkerHealth,
    /// Tasks queued or running on this worker
    pub in_flight: usize,
    /// Tasks this worker finished with a verdict
    pub completed: u64,
    /// Faults caught by the supervisor
    pub faults: u64,
    /// Respawns after a fault
    pub restarts: u64,
}

/// Dispatcher snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Per-worker detail
    pub workers: Vec<WorkerStats>,
    /// Workers currently accepting work
    pub healthy_workers: usize,
    /// Tasks accepted into a queue
    pub submitted: u64,
    /// Tasks that produced a verdict
    pub completed: u64,
    /// Tasks failed by a worker fault or detector outage
    pub failed: u64,
    /// Tasks that missed their deadline
    pub timed_out: u64,
    /// Tasks skipped because the caller went away
    pub cancelled: u64,
    /// Submissions refused with `QueueFull` or `WorkerUnavailable`
    pub rejected: u64,
    /// Tasks moved to another worker after a fault
    pub redispatched: u64,
}

impl DispatcherStats {
    pub(crate) fn collect(workers: Vec<WorkerStats>, totals: &TaskTotals) -> Self {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Self {
            healthy_workers: workers
                .iter()
                .filter(|w| w.health == WorkerHealth::Healthy)
                .count(),
            workers,
            submitted: load(&totals.submitted),
            completed: load(&totals.completed),
            failed: load(&totals.failed),
            timed_out: load(&totals.timed_out),
            cancelled: load(&totals.cancelled),
            rejected: load(&totals.rejected),
            redispatched: load(&totals.redispatched),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_one_saturates() {
        let counters = WorkerCounters::default();
        counters.in_flight.store(1, Ordering::SeqCst);
        counters.finish_one();
        counters.finish_one();
        assert_eq!(counters.in_flight(), 0);
    }

    #[test]
    fn test_collect_counts_healthy() {
        let a = WorkerCounters::default();
        let b = WorkerCounters::default();
        b.set_healthy(false);
        let totals = TaskTotals::default();
        TaskTotals::bump(&totals.completed);

        let stats = DispatcherStats::collect(vec![a.snapshot(0), b.snapshot(1)], &totals);
        assert_eq!(stats.healthy_workers, 1);
        assert_eq!(stats.workers[1].health, WorkerHealth::Unavailable);
        assert_eq!(stats.completed, 1);
    }
}
