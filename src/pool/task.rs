//! Units of work handed to workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::aggregate::DetectionResult;
use crate::cache::{content_fingerprint, Fingerprint};
use crate::detector::Metadata;
use crate::error::Result;

/// Content to classify.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPayload {
    /// Raw content
    pub content: String,
    /// Request metadata
    pub metadata: Metadata,
    /// Content fingerprint (the result-cache key)
    pub fingerprint: Fingerprint,
}

impl TaskPayload {
    /// Bundle content with its metadata and fingerprint it
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Self {
        let content = content.into();
        let fingerprint = content_fingerprint(&content, &metadata);
        Self {
            content,
            metadata,
            fingerprint,
        }
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in a worker queue
    Queued,
    /// Detectors running
    Running,
    /// Verdict delivered
    Done,
    /// Worker faulted or every detector errored
    Failed,
    /// Deadline passed before a verdict
    TimedOut,
    /// Caller stopped waiting before the task ran
    Cancelled,
}

impl TaskState {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Running)
    }
}

/// One detection request in flight through the pool.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Task id (UUID v4)
    pub id: String,
    /// What to classify
    pub payload: Arc<TaskPayload>,
    /// When the caller submitted
    pub submitted_at: Instant,
    /// When detectors get cancelled
    pub deadline: Instant,
    /// Current state
    pub state: TaskState,
    /// Dispatch attempts so far (redispatch after a fault bumps this)
    pub attempts: u32,
}

impl WorkerTask {
    /// New queued task due `timeout` from now
    pub fn new(payload: Arc<TaskPayload>, timeout: Duration) -> Self {
        let submitted_at = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            submitted_at,
            deadline: submitted_at + timeout,
            state: TaskState::Queued,
            attempts: 0,
        }
    }

    /// Move to `next`, logging the transition
    pub fn transition(&mut self, next: TaskState) {
        tracing::trace!(task = %self.id, from = ?self.state, to = ?next, "task state");
        self.state = next;
    }

    /// Time since submission
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Whether the deadline has passed
    pub fn is_overdue(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// A task plus the channel its verdict goes back on.
pub(crate) struct Job {
    pub(crate) task: WorkerTask,
    pub(crate) reply: oneshot::Sender<Result<DetectionResult>>,
}
