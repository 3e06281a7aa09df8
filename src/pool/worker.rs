//! Worker loop and its supervisor.
//!
//! Each worker owns one bounded queue. The supervisor pulls jobs off it and
//! runs them one at a time; a panic inside a job is caught at the job
//! boundary, the worker is marked unavailable, the orphaned task is failed or
//! redispatched, jobs still queued behind it move to healthy workers, and the
//! worker comes back after an exponential backoff.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::task::{Job, TaskState, WorkerTask};
use super::Shared;
use crate::aggregate::{DetectionResult, DetectorOutcome};
use crate::cache::normalize_into;
use crate::detector::{DetectionInput, Verdict};
use crate::error::{GateError, Result};

/// A job whose worker panicked mid-run.
pub(crate) struct Fault {
    pub(crate) job: Job,
    pub(crate) reason: String,
}

/// Supervise worker `id` until shutdown, then fail whatever is still queued.
pub(crate) async fn supervise(id: usize, shared: Arc<Shared>, mut rx: mpsc::Receiver<Job>) {
    let mut shutdown = shared.shutdown.subscribe();
    let counters = &shared.workers[id];
    let mut consecutive_faults: u32 = 0;

    tracing::debug!(worker = id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Err(fault) = run_job(id, &shared, job).await else {
            consecutive_faults = 0;
            continue;
        };

        counters.set_healthy(false);
        counters.faults.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            worker = id,
            task = %fault.job.task.id,
            reason = %fault.reason,
            "worker fault, marking unavailable"
        );
        shared.recover(id, fault).await;
        hand_off_queued(id, &shared, &mut rx).await;

        let backoff = respawn_backoff(
            shared.config.respawn_backoff_base_ms,
            shared.config.respawn_backoff_max_ms,
            consecutive_faults,
        );
        consecutive_faults = consecutive_faults.saturating_add(1);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(backoff) => {},
        }

        counters.set_healthy(true);
        counters.restarts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(worker = id, backoff_ms = backoff.as_millis() as u64, "worker respawned");
    }

    rx.close();
    let mut drained = 0usize;
    while let Ok(job) = rx.try_recv() {
        counters.finish_one();
        let _ = job.reply.send(Err(GateError::ShuttingDown("dispatcher")));
        drained += 1;
    }
    tracing::debug!(worker = id, drained, "worker stopped");
}

/// Move jobs stuck behind a fault to healthy workers instead of letting
/// them age through the respawn backoff.
async fn hand_off_queued(id: usize, shared: &Shared, rx: &mut mpsc::Receiver<Job>) {
    let counters = &shared.workers[id];
    let mut moved = 0usize;
    while let Ok(job) = rx.try_recv() {
        counters.finish_one();
        if job.reply.is_closed() {
            shared.totals.cancelled.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        match shared.dispatch(job, Some(id), None).await {
            Ok(to) => {
                moved += 1;
                shared.totals.redispatched.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(from = id, to, "queued task handed off");
            },
            Err(rejected) => {
                shared.totals.rejected.fetch_add(1, Ordering::Relaxed);
                let _ = rejected.job.reply.send(Err(rejected.error));
            },
        }
    }
    if moved > 0 {
        tracing::info!(worker = id, moved, "handed off queued tasks");
    }
}

/// `base × 2^faults`, capped at `max`.
pub(crate) fn respawn_backoff(base_ms: u64, max_ms: u64, faults: u32) -> Duration {
    let factor = 1u64.checked_shl(faults.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}

async fn run_job(id: usize, shared: &Shared, job: Job) -> std::result::Result<(), Fault> {
    let counters = &shared.workers[id];
    let Job { mut task, reply } = job;

    if reply.is_closed() {
        counters.finish_one();
        task.transition(TaskState::Cancelled);
        shared.totals.cancelled.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    if task.is_overdue() {
        counters.finish_one();
        task.transition(TaskState::TimedOut);
        shared.totals.timed_out.fetch_add(1, Ordering::Relaxed);
        let _ = reply.send(Err(GateError::TaskTimedOut {
            task_id: task.id.clone(),
            elapsed_ms: task.elapsed().as_millis() as u64,
        }));
        return Ok(());
    }

    task.transition(TaskState::Running);
    let outcome = AssertUnwindSafe(execute(shared, &task)).catch_unwind().await;
    counters.finish_one();

    match outcome {
        Ok(result) => {
            match &result {
                Ok(_) => {
                    task.transition(TaskState::Done);
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    shared.totals.completed.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    task.transition(TaskState::Failed);
                    shared.totals.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(worker = id, task = %task.id, error = %e, "task failed");
                },
            }
            // The caller may have stopped waiting; the verdict is discarded then
            let _ = reply.send(result);
            Ok(())
        },
        Err(panic) => Err(Fault {
            job: Job { task, reply },
            reason: panic_message(panic.as_ref()),
        }),
    }
}

/// Normalize into a leased buffer, run every detector to the deadline, aggregate.
async fn execute(shared: &Shared, task: &WorkerTask) -> Result<DetectionResult> {
    let payload = &task.payload;
    let mut scratch = shared.buffers.lease(payload.content.len()).await?;

    let len = normalize_into(&payload.content, &mut scratch).ok_or(GateError::BufferTooLarge {
        requested: payload.content.len(),
        largest: scratch.len(),
    })?;
    let normalized = std::str::from_utf8(&scratch[..len]).map_err(|e| GateError::TaskFailed {
        task_id: task.id.clone(),
        reason: format!("normalization produced invalid utf-8: {e}"),
    })?;

    let input = DetectionInput::new(&payload.content, normalized, &payload.metadata);
    let input = &input;
    let deadline = task.deadline;

    let runs = shared.detectors.iter().map(|detector| async move {
        let id = detector.id().to_string();
        let outcome = match tokio::time::timeout_at(deadline, detector.analyze(input)).await {
            Ok(Ok(Verdict::Vote(finding))) => DetectorOutcome::Vote(finding),
            Ok(Ok(Verdict::Abstain)) => DetectorOutcome::Abstained,
            Ok(Err(e)) => {
                tracing::warn!(detector = %id, task = %task.id, error = %e, "detector error");
                DetectorOutcome::Failed(e.to_string())
            },
            Err(_) => {
                tracing::debug!(detector = %id, task = %task.id, "detector cancelled at deadline");
                DetectorOutcome::TimedOut
            },
        };
        (id, outcome)
    });
    let outcomes = futures::future::join_all(runs).await;
    drop(scratch);

    let mut result = shared.aggregator.aggregate(payload.fingerprint, outcomes)?;
    result.latency_ms = task.elapsed().as_secs_f64() * 1000.0;

    tracing::debug!(
        task = %task.id,
        detected = result.detected,
        confidence = result.confidence,
        incomplete = result.incomplete,
        "task complete"
    );
    Ok(result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
