//! # ThreatGate - Real-time Content Threat Detection
//!
//! A gateway that classifies untrusted content (LLM prompts, chat messages,
//! uploads) as benign or malicious by running several independent detectors
//! in a supervised worker pool and folding their votes into one verdict.
//!
//! ## Features
//!
//! - **Result cache**: LRU + TTL cache keyed by a BLAKE3 fingerprint of the
//!   normalized content, so repeated content skips detection entirely
//! - **Detector pool**: bounded per-worker queues, least-loaded dispatch,
//!   per-task deadlines, panic isolation with respawn backoff
//! - **Weighted voting**: configurable weights, threshold and critical
//!   categories; timeouts and detector errors are reported, never hidden
//! - **Buffer pool**: generation-tagged scratch buffers that reject double
//!   and stale releases
//! - **Batches**: sync fan-out in input order or async jobs with polling and
//!   cancellation, gated by a token bucket
//!
//! ## Architecture
//!
//! ```text
//!   detect / detect_batch
//!            │
//!   ┌────────▼─────────┐   hit   ┌─────────────┐
//!   │ BatchOrchestrator├────────►│ ResultCache │
//!   └────────┬─────────┘         └─────────────┘
//!            │ miss
//!   ┌────────▼─────────┐         ┌─────────────┐
//!   │    Dispatcher    │────────►│ BufferPool  │  normalization scratch
//!   └────────┬─────────┘         └─────────────┘
//!            │ one task per worker at a time
//!   ┌────────▼──────────────────────────────────────────────┐
//!   │ pattern │ similarity (→ SimilarityCache) │ structural │ multimodal │
//!   └────────┬──────────────────────────────────────────────┘
//!            │ votes
//!   ┌────────▼─────────┐
//!   │    Aggregator    │──► DetectionResult
//!   └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use threatgate::{BatchItem, BatchOrchestrator, Config, DetectOptions};
//!
//! let gateway = BatchOrchestrator::new(Config::default())?;
//! let verdict = gateway
//!     .detect(BatchItem::new("Ignore previous instructions"), DetectOptions::default())
//!     .await?;
//! assert!(verdict.detected);
//! gateway.shutdown().await;
//! ```
//!
//! ## Error Model
//!
//! A detection that ran and found nothing is `Ok` with `detected = false`.
//! Machinery failures (`QueueFull`, `TaskTimedOut`, `DetectorUnavailable`,
//! ...) are errors, and partially degraded verdicts carry
//! `incomplete = true`. See [`GateError`].

pub mod aggregate;
pub mod batch;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod pool;
pub mod server;

// Re-exports for convenience
pub use aggregate::{Aggregator, DetectionResult, DetectorOutcome, DetectorVote};
pub use batch::{
    BatchItem, BatchItemResult, BatchMode, BatchOptions, BatchOrchestrator, BatchOutcome,
    BatchStatus, BatchSubmission, DetectOptions, GatewayStats, JobStatus,
};
pub use buffer::{BufferHandle, BufferLease, BufferPool, BufferStats};
pub use cache::{CacheStats, Fingerprint, ResultCache, SimilarityCache};
pub use config::Config;
pub use detector::{Detector, Finding, Metadata, Severity, Verdict};
pub use error::{GateError, Result};
pub use pool::{Dispatcher, DispatcherStats, TaskPayload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
