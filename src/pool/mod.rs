//! Detection worker pool.
//!
//! The [`Dispatcher`] fans tasks out over `worker_count` workers, each with
//! a bounded queue:
//!
//! ```text
//! submit ─► pick least-loaded healthy worker ─► bounded queue ─► worker
//!                                                                 │
//!                         lease scratch buffer, normalize ◄───────┘
//!                         run detectors to the deadline (join_all)
//!                         aggregate votes ─► oneshot reply
//! ```
//!
//! Ties on load are broken round-robin. A full queue fails fast with
//! `QueueFull` unless `pool.submit_wait_ms` allows a bounded wait. A worker
//! that panics is marked unavailable, its task is failed or redispatched
//! once (see [`FaultPolicy`]), and it respawns with exponential backoff.

mod stats;
mod task;
mod worker;

pub use stats::{DispatcherStats, WorkerHealth, WorkerStats};
pub use task::{TaskPayload, TaskState, WorkerTask};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::aggregate::{Aggregator, DetectionResult};
use crate::buffer::BufferPool;
use crate::config::{AggregationConfig, FaultPolicy, PoolConfig};
use crate::detector::Detector;
use crate::error::{GateError, Result};
use stats::{TaskTotals, WorkerCounters};
use task::Job;
use worker::Fault;

/// State shared by the dispatcher and every supervisor.
pub(crate) struct Shared {
    config: PoolConfig,
    detectors: Vec<Arc<dyn Detector>>,
    aggregator: Aggregator,
    buffers: Arc<BufferPool>,
    senders: Vec<mpsc::Sender<Job>>,
    workers: Vec<WorkerCounters>,
    next: AtomicUsize,
    totals: TaskTotals,
    shutdown: watch::Sender<bool>,
}

/// A job the chosen queue refused, handed back to the caller.
struct Rejected {
    error: GateError,
    job: Job,
}

impl Shared {
    /// Least in-flight healthy worker, scanning from a rotating start so
    /// equally loaded workers take turns.
    fn pick(&self, exclude: Option<usize>) -> Option<usize> {
        let n = self.senders.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|offset| (start + offset) % n)
            .filter(|&i| Some(i) != exclude && self.workers[i].is_healthy())
            .min_by_key(|&i| self.workers[i].in_flight())
    }

    async fn dispatch(
        &self,
        job: Job,
        exclude: Option<usize>,
        wait: Option<Duration>,
    ) -> std::result::Result<usize, Rejected> {
        let Some(worker) = self.pick(exclude) else {
            return Err(Rejected {
                error: GateError::WorkerUnavailable("no healthy worker".into()),
                job,
            });
        };

        let counters = &self.workers[worker];
        counters.in_flight.fetch_add(1, Ordering::AcqRel);

        let depth = self.config.queue_depth_per_worker;
        let sent = match wait {
            None => self.senders[worker].try_send(job).map_err(|e| match e {
                TrySendError::Full(job) => Rejected {
                    error: GateError::QueueFull { worker, depth },
                    job,
                },
                TrySendError::Closed(job) => Rejected {
                    error: GateError::ShuttingDown("dispatcher"),
                    job,
                },
            }),
            Some(wait) => self.senders[worker]
                .send_timeout(job, wait)
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(job) => Rejected {
                        error: GateError::QueueFull { worker, depth },
                        job,
                    },
                    SendTimeoutError::Closed(job) => Rejected {
                        error: GateError::ShuttingDown("dispatcher"),
                        job,
                    },
                }),
        };

        if sent.is_err() {
            counters.finish_one();
        }
        sent.map(|()| worker)
    }

    /// Settle a task orphaned by a worker fault.
    async fn recover(&self, faulted: usize, fault: Fault) {
        let Fault { job, reason } = fault;
        let Job { mut task, reply } = job;

        let retry = self.config.fault_policy == FaultPolicy::RedispatchOnce
            && task.attempts == 0
            && !task.is_overdue()
            && !reply.is_closed();

        let reply = if retry {
            task.attempts += 1;
            task.transition(TaskState::Queued);
            match self.dispatch(Job { task, reply }, Some(faulted), None).await {
                Ok(worker) => {
                    TaskTotals::bump(&self.totals.redispatched);
                    tracing::info!(from = faulted, to = worker, "task redispatched after fault");
                    return;
                },
                Err(Rejected { error, job }) => {
                    tracing::warn!(error = %error, "redispatch refused");
                    task = job.task;
                    job.reply
                },
            }
        } else {
            reply
        };

        task.transition(TaskState::Failed);
        TaskTotals::bump(&self.totals.failed);
        let _ = reply.send(Err(GateError::TaskFailed {
            task_id: task.id.clone(),
            reason,
        }));
    }
}

/// Fixed-size pool of supervised detection workers.
pub struct Dispatcher {
    shared: Arc<Shared>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn new(
        config: PoolConfig,
        aggregation: AggregationConfig,
        detectors: Vec<Arc<dyn Detector>>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self> {
        if config.worker_count == 0 || config.queue_depth_per_worker == 0 {
            return Err(GateError::Config(
                "dispatcher needs at least one worker and a non-empty queue".into(),
            ));
        }
        if detectors.is_empty() {
            return Err(GateError::Config("dispatcher needs at least one detector".into()));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..config.worker_count)
            .map(|_| mpsc::channel(config.queue_depth_per_worker))
            .unzip();
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            aggregator: Aggregator::new(aggregation, config.failure_policy),
            workers: (0..config.worker_count).map(|_| WorkerCounters::default()).collect(),
            config,
            detectors,
            buffers,
            senders,
            next: AtomicUsize::new(0),
            totals: TaskTotals::default(),
            shutdown,
        });

        let supervisors = receivers
            .into_iter()
            .enumerate()
            .map(|(id, rx)| tokio::spawn(worker::supervise(id, Arc::clone(&shared), rx)))
            .collect();

        tracing::info!(
            workers = shared.config.worker_count,
            queue_depth = shared.config.queue_depth_per_worker,
            detectors = shared.detectors.len(),
            "dispatcher started"
        );

        Ok(Self {
            shared,
            supervisors: Mutex::new(supervisors),
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Ids of the configured detectors, in run order
    pub fn detector_ids(&self) -> Vec<String> {
        self.shared.detectors.iter().map(|d| d.id().to_string()).collect()
    }

    /// Classify one payload.
    ///
    /// Resolves with the aggregated verdict, or with `QueueFull`,
    /// `WorkerUnavailable`, `TaskTimedOut`, `TaskFailed`,
    /// `DetectorUnavailable` or `ShuttingDown`. Dropping the returned future
    /// cancels the task if it has not started.
    pub async fn submit(&self, payload: Arc<TaskPayload>) -> Result<DetectionResult> {
        let shared = &self.shared;
        if *shared.shutdown.borrow() {
            return Err(GateError::ShuttingDown("dispatcher"));
        }

        let task = WorkerTask::new(payload, shared.config.task_timeout());
        let task_id = task.id.clone();
        // Backstop in case a worker stalls past the deadline it enforces itself
        let backstop = task.deadline + shared.config.task_timeout();
        let submitted_at = task.submitted_at;

        let (reply, verdict) = oneshot::channel();
        if let Err(Rejected { error, .. }) = shared
            .dispatch(Job { task, reply }, None, shared.config.submit_wait())
            .await
        {
            TaskTotals::bump(&shared.totals.rejected);
            tracing::debug!(task = %task_id, error = %error, "submission rejected");
            return Err(error);
        }
        TaskTotals::bump(&shared.totals.submitted);

        match tokio::time::timeout_at(backstop, verdict).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GateError::TaskFailed {
                task_id,
                reason: "worker dropped the task".into(),
            }),
            Err(_) => {
                TaskTotals::bump(&shared.totals.timed_out);
                Err(GateError::TaskTimedOut {
                    task_id,
                    elapsed_ms: submitted_at.elapsed().as_millis() as u64,
                })
            },
        }
    }

    /// Per-worker and pool-wide counters
    pub fn stats(&self) -> DispatcherStats {
        let workers = self
            .shared
            .workers
            .iter()
            .enumerate()
            .map(|(id, w)| w.snapshot(id))
            .collect();
        DispatcherStats::collect(workers, &self.shared.totals)
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Stop accepting work, fail queued tasks with `ShuttingDown`, join
    /// every supervisor. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.supervisors.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "supervisor exited abnormally");
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.shared.config.worker_count)
            .field("detectors", &self.detector_ids())
            .finish()
    }
}
