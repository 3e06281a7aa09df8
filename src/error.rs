//! ThreatGate error types.
//!
//! # Error Classification
//!
//! Errors fall into three groups, and callers are expected to treat them
//! differently:
//!
//! - **Transient** (`QueueFull`, `RateLimited`, `WorkerUnavailable`,
//!   `PoolExhausted`): surfaced to the immediate caller for retry, never
//!   swallowed. [`GateError::is_retryable`] returns `true` and
//!   [`GateError::retry_after`] carries a hint when one is known.
//! - **Misuse** (`DoubleRelease`, `StaleHandle`, `BufferTooLarge`): rejected at the point of
//!   misuse. Shared state is left untouched.
//! - **Request-scoped** (`BatchTooLarge`, `PayloadTooLarge`, `TaskFailed`,
//!   `TaskTimedOut`, `DetectorUnavailable`, `BatchItemFailed`): the request
//!   failed, the gateway did not.
//!
//! A detection that *ran* and found nothing is `Ok(DetectionResult)` with
//! `detected == false`. A detection that could not run is always an `Err`, so
//! "benign" and "machinery failed" are never conflated.

use std::time::Duration;

use thiserror::Error;

/// ThreatGate errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    /// Buffer demand exceeds pool capacity. Retryable after a release.
    #[error("Buffer pool exhausted: {in_use} buffers in use (max {max_buffers})")]
    PoolExhausted {
        /// Buffers currently checked out.
        in_use: usize,
        /// Configured pool ceiling.
        max_buffers: usize,
    },

    /// A buffer handle was released twice or is stale.
    #[error("Double release of buffer {index} (handle generation {presented}, current {current})")]
    DoubleRelease {
        /// Arena slot index.
        index: usize,
        /// Generation carried by the presented handle.
        presented: u64,
        /// Generation currently held by the slot.
        current: u64,
    },

    /// A buffer handle was used for access after its buffer was released.
    #[error("Stale handle for buffer {index} (handle generation {presented}, current {current})")]
    StaleHandle {
        /// Arena slot index.
        index: usize,
        /// Generation carried by the presented handle.
        presented: u64,
        /// Generation currently held by the slot.
        current: u64,
    },

    /// Requested scratch size exceeds the largest configured size class.
    #[error("No buffer size class fits {requested} bytes (largest {largest})")]
    BufferTooLarge {
        /// Requested minimum length.
        requested: usize,
        /// Largest configured class.
        largest: usize,
    },

    /// The selected worker's queue is at its configured depth.
    #[error("Worker {worker} queue full (depth {depth})")]
    QueueFull {
        /// Worker that was selected.
        worker: usize,
        /// Configured per-worker queue depth.
        depth: usize,
    },

    /// No healthy worker can accept work right now.
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A task exceeded its deadline without producing a result.
    #[error("Task {task_id} timed out after {elapsed_ms}ms")]
    TaskTimedOut {
        /// Task identifier.
        task_id: String,
        /// Time between submission and giving up.
        elapsed_ms: u64,
    },

    /// A task failed because its worker faulted.
    #[error("Task {task_id} failed: {reason}")]
    TaskFailed {
        /// Task identifier.
        task_id: String,
        /// Fault description.
        reason: String,
    },

    /// Token bucket empty.
    #[error("Rate limited, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        /// Earliest time a retry can succeed.
        retry_after: Duration,
    },

    /// Batch rejected before any work began.
    #[error("Batch of {size} items exceeds maximum {max}")]
    BatchTooLarge {
        /// Submitted batch size.
        size: usize,
        /// Configured `batch.max_batch_size`.
        max: usize,
    },

    /// A single batch item failed. Never fails the batch as a whole.
    #[error("Batch item {index} failed: {reason}")]
    BatchItemFailed {
        /// Position of the item in the batch.
        index: usize,
        /// Underlying failure.
        reason: String,
    },

    /// Detector missing or erroring. As a vote this abstains; as an error it
    /// means no detector could produce a vote at all.
    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    /// Content exceeds the configured maximum scan size.
    #[error("Payload too large: {size} > {max} bytes")]
    PayloadTooLarge {
        /// Content size in bytes.
        size: usize,
        /// Configured `max_content_bytes`.
        max: usize,
    },

    /// Async batch job unknown, already fetched, or expired.
    #[error("Batch job not found: {0}")]
    JobNotFound(String),

    /// Component has been shut down.
    #[error("Shutting down: {0}")]
    ShuttingDown(&'static str),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias for ThreatGate operations
pub type Result<T> = std::result::Result<T, GateError>;

impl GateError {
    /// Transient conditions the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::PoolExhausted { .. }
                | GateError::QueueFull { .. }
                | GateError::WorkerUnavailable(_)
                | GateError::RateLimited { .. }
        )
    }

    /// Retry hint, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GateError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short machine-readable code, used in HTTP error bodies and batch slots.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::PoolExhausted { .. } => "pool_exhausted",
            GateError::DoubleRelease { .. } => "double_release",
            GateError::StaleHandle { .. } => "stale_handle",
            GateError::BufferTooLarge { .. } => "buffer_too_large",
            GateError::QueueFull { .. } => "queue_full",
            GateError::WorkerUnavailable(_) => "worker_unavailable",
            GateError::TaskTimedOut { .. } => "task_timed_out",
            GateError::TaskFailed { .. } => "task_failed",
            GateError::RateLimited { .. } => "rate_limited",
            GateError::BatchTooLarge { .. } => "batch_too_large",
            GateError::BatchItemFailed { .. } => "batch_item_failed",
            GateError::DetectorUnavailable(_) => "detector_unavailable",
            GateError::PayloadTooLarge { .. } => "payload_too_large",
            GateError::JobNotFound(_) => "job_not_found",
            GateError::ShuttingDown(_) => "shutting_down",
            GateError::Config(_) => "config",
            GateError::Json(_) => "json",
            GateError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Json(err.to_string())
    }
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for GateError {
    fn from(err: toml::de::Error) -> Self {
        GateError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(GateError::QueueFull { worker: 0, depth: 4 }.is_retryable());
        assert!(GateError::WorkerUnavailable("respawning".into()).is_retryable());
        assert!(GateError::RateLimited {
            retry_after: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(!GateError::DoubleRelease {
            index: 0,
            presented: 1,
            current: 2
        }
        .is_retryable());
        assert!(!GateError::BatchTooLarge { size: 10, max: 5 }.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = GateError::RateLimited {
            retry_after: Duration::from_millis(250),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
        assert_eq!(err.code(), "rate_limited");
        assert!(err.to_string().contains("250ms"));
        assert_eq!(GateError::JobNotFound("x".into()).retry_after(), None);
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err: GateError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert_eq!(err.code(), "config");
    }
}
