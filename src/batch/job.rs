//! Batch jobs and the store that holds async ones.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::aggregate::DetectionResult;
use crate::detector::Metadata;
use crate::error::{GateError, Result};

/// One piece of content in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Content to classify
    pub content: String,
    /// Request metadata (attachments, similarity filters, caller tags)
    #[serde(default)]
    pub metadata: Metadata,
}

impl BatchItem {
    /// Item without metadata
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Per-item outcome, positioned like the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItemResult {
    /// Verdict produced
    Success(DetectionResult),
    /// Item failed; the rest of the batch is unaffected
    Error {
        /// Stable error code of the underlying failure
        code: String,
        /// Human-readable message
        message: String,
    },
}

impl BatchItemResult {
    /// Whether the item failed
    pub fn is_error(&self) -> bool {
        matches!(self, BatchItemResult::Error { .. })
    }

    /// The verdict, if any
    pub fn result(&self) -> Option<&DetectionResult> {
        match self {
            BatchItemResult::Success(result) => Some(result),
            BatchItemResult::Error { .. } => None,
        }
    }

    pub(crate) fn failed(index: usize, error: &GateError) -> Self {
        let wrapped = GateError::BatchItemFailed {
            index,
            reason: error.to_string(),
        };
        BatchItemResult::Error {
            code: error.code().to_string(),
            message: wrapped.to_string(),
        }
    }
}

/// Batch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepted, not started
    Pending,
    /// Items in flight
    Running,
    /// Every item finished, failures within tolerance
    Completed,
    /// Failed fraction above `batch.partial_failure_fraction`
    PartiallyFailed,
    /// Every item failed
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl BatchStatus {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }

    /// Final status of a finished batch
    pub fn settle(results: &[BatchItemResult], partial_failure_fraction: f64) -> Self {
        let failed = results.iter().filter(|r| r.is_error()).count();
        if failed > 0 && failed == results.len() {
            BatchStatus::Failed
        } else if failed > 0
            && failed as f64 / results.len() as f64 > partial_failure_fraction
        {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Completed
        }
    }
}

/// Progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Items in the batch
    pub total: usize,
    /// Items finished, either way
    pub completed: usize,
    /// Items that failed
    pub failed: usize,
}

impl BatchProgress {
    /// Finished fraction in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Result of a synchronous batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Final status
    pub status: BatchStatus,
    /// Per-item results in input order
    pub results: Vec<BatchItemResult>,
}

/// Snapshot of an async job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id
    pub job_id: String,
    /// Current status
    pub status: BatchStatus,
    /// Progress
    pub progress: BatchProgress,
    /// Per-item results so far, `None` where the item is still pending
    pub partial_results: Vec<Option<BatchItemResult>>,
}

/// An async batch tracked by the store.
#[derive(Debug)]
pub struct BatchJob {
    /// Job id (UUID v4)
    pub id: String,
    /// Submitted items
    pub items: Arc<[BatchItem]>,
    /// Current status
    pub status: BatchStatus,
    /// Position-indexed results
    pub results: Vec<Option<BatchItemResult>>,
    /// When the job was accepted
    pub created_at: DateTime<Utc>,
    finished_at: Option<Instant>,
    cancel: Arc<Notify>,
}

impl BatchJob {
    /// Pending job over `items`
    pub fn new(items: Arc<[BatchItem]>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            results: vec![None; items.len()],
            items,
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            cancel: Arc::new(Notify::new()),
        }
    }

    /// Signal fired when the job is cancelled
    pub fn cancel_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.cancel)
    }

    /// Progress counters
    pub fn progress(&self) -> BatchProgress {
        let done = self.results.iter().flatten();
        BatchProgress {
            total: self.results.len(),
            completed: done.clone().count(),
            failed: done.filter(|r| r.is_error()).count(),
        }
    }

    fn snapshot(&self) -> JobStatus {
        JobStatus {
            job_id: self.id.clone(),
            status: self.status,
            progress: self.progress(),
            partial_results: self.results.clone(),
        }
    }

    fn finish(&mut self, status: BatchStatus) {
        self.status = status;
        self.finished_at = Some(Instant::now());
    }
}

/// Async jobs by id.
///
/// A job stays retrievable until its terminal status is read or until
/// `batch.job_ttl_ms` after it finished. Running jobs never expire.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, BatchJob>>,
}

impl JobStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job, returning its id
    pub fn insert(&self, job: BatchJob) -> String {
        let id = job.id.clone();
        self.jobs.lock().insert(id.clone(), job);
        id
    }

    /// `Pending → Running`; false if the job is gone or already terminal
    pub fn start(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(id) {
            Some(job) if job.status == BatchStatus::Pending => {
                job.status = BatchStatus::Running;
                true
            },
            _ => false,
        }
    }

    /// Store one item's result. Late results for a cancelled or evicted job
    /// are discarded and reported as `false`.
    pub fn record(&self, id: &str, index: usize, result: BatchItemResult) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        match job.results.get_mut(index) {
            Some(slot) => {
                *slot = Some(result);
                true
            },
            None => false,
        }
    }

    /// Settle a running job once every item has a result
    pub fn complete(&self, id: &str, partial_failure_fraction: f64) -> Option<BatchStatus> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(id)?;
        if job.status.is_terminal() {
            return Some(job.status);
        }
        let results: Vec<BatchItemResult> = job.results.iter().flatten().cloned().collect();
        let status = if results.len() == job.results.len() {
            BatchStatus::settle(&results, partial_failure_fraction)
        } else {
            // Items lost without a result count as failures
            BatchStatus::Failed
        };
        job.finish(status);
        Some(status)
    }

    /// Cancel a job. Idempotent; a job that already finished keeps its status.
    pub fn cancel(&self, id: &str) -> Result<BatchStatus> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| GateError::JobNotFound(id.to_string()))?;
        if !job.status.is_terminal() {
            job.finish(BatchStatus::Cancelled);
            job.cancel.notify_one();
            tracing::info!(job = %id, "batch cancelled");
        }
        Ok(job.status)
    }

    /// Current status. A terminal status is handed out once and the job is
    /// removed.
    pub fn fetch(&self, id: &str) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get(id)
            .ok_or_else(|| GateError::JobNotFound(id.to_string()))?;
        let status = job.snapshot();
        if status.status.is_terminal() {
            jobs.remove(id);
        }
        Ok(status)
    }

    /// Drop terminal jobs finished more than `ttl` ago
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.finished_at
                .is_none_or(|finished| now.saturating_duration_since(finished) < ttl)
        });
        before - jobs.len()
    }

    /// Cancel everything still running
    pub fn cancel_all(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let mut cancelled = 0;
        for job in jobs.values_mut().filter(|j| !j.status.is_terminal()) {
            job.finish(BatchStatus::Cancelled);
            job.cancel.notify_one();
            cancelled += 1;
        }
        cancelled
    }

    /// `(active, retained)`: jobs still running and all jobs held
    pub fn counts(&self) -> (usize, usize) {
        let jobs = self.jobs.lock();
        let active = jobs.values().filter(|j| !j.status.is_terminal()).count();
        (active, jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::content_fingerprint;

    fn ok() -> BatchItemResult {
        BatchItemResult::Success(DetectionResult::benign(content_fingerprint("x", &Metadata::new())))
    }

    fn err() -> BatchItemResult {
        BatchItemResult::failed(0, &GateError::QueueFull { worker: 0, depth: 1 })
    }

    fn job(n: usize) -> BatchJob {
        BatchJob::new((0..n).map(|i| BatchItem::new(format!("item {i}"))).collect())
    }

    #[test]
    fn test_settle() {
        assert_eq!(BatchStatus::settle(&[ok(), ok()], 0.0), BatchStatus::Completed);
        assert_eq!(BatchStatus::settle(&[ok(), err()], 0.0), BatchStatus::PartiallyFailed);
        assert_eq!(BatchStatus::settle(&[ok(), err()], 0.5), BatchStatus::Completed);
        assert_eq!(BatchStatus::settle(&[err(), err()], 1.0), BatchStatus::Failed);
        assert_eq!(BatchStatus::settle(&[], 0.0), BatchStatus::Completed);
    }

    #[test]
    fn test_item_error_serializes_with_code() {
        let value = serde_json::to_value(err()).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["code"], "queue_full");
        assert!(value["message"].as_str().unwrap().contains("item 0"));

        let value = serde_json::to_value(ok()).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["detected"], false);
    }

    #[test]
    fn test_fetch_removes_terminal_job() {
        let store = JobStore::new();
        let id = store.insert(job(2));
        assert!(store.start(&id));
        assert!(store.record(&id, 1, ok()));

        let status = store.fetch(&id).unwrap();
        assert_eq!(status.status, BatchStatus::Running);
        assert_eq!(status.progress.completed, 1);
        assert_eq!(status.partial_results[0], None);

        assert!(store.record(&id, 0, err()));
        assert_eq!(store.complete(&id, 0.0), Some(BatchStatus::PartiallyFailed));
        assert_eq!(store.fetch(&id).unwrap().status, BatchStatus::PartiallyFailed);
        assert!(matches!(store.fetch(&id), Err(GateError::JobNotFound(_))));
    }

    #[test]
    fn test_cancel_is_idempotent_and_discards_late_results() {
        let store = JobStore::new();
        let id = store.insert(job(3));
        store.start(&id);

        assert_eq!(store.cancel(&id).unwrap(), BatchStatus::Cancelled);
        assert_eq!(store.cancel(&id).unwrap(), BatchStatus::Cancelled);
        assert!(!store.record(&id, 0, ok()));
        assert_eq!(store.complete(&id, 0.0), Some(BatchStatus::Cancelled));
        assert!(matches!(store.cancel("nope"), Err(GateError::JobNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_counts_ttl_from_completion() {
        let store = JobStore::new();
        let running = store.insert(job(1));
        store.start(&running);
        let done = store.insert(job(1));
        store.start(&done);
        store.record(&done, 0, ok());
        store.complete(&done, 0.0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.sweep(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.sweep(Duration::from_secs(60)), 1);
        assert_eq!(store.counts(), (1, 1));
    }
}
