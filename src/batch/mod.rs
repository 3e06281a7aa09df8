//! Request orchestration: single detections, sync and async batches.
//!
//! ```text
//! detect ─► size check ─► ResultCache ─hit─► verdict
//!                              │ miss
//!                              ▼
//!                          Dispatcher ─► verdict ─► cache (unless incomplete)
//!
//! detect_batch ─► BatchTooLarge? ─► TokenBucket ─► sync: bounded fan-out, input order
//!                                                 async: job id, poll / cancel
//! ```
//!
//! The orchestrator owns every shared component (caches, buffer pool,
//! dispatcher) and a background sweeper that expires jobs and cache entries.

mod job;
mod rate_limit;

pub use job::{
    BatchItem, BatchItemResult, BatchJob, BatchOutcome, BatchProgress, BatchStatus, JobStatus,
    JobStore,
};
pub use rate_limit::TokenBucket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::aggregate::DetectionResult;
use crate::buffer::{BufferPool, BufferStats};
use crate::cache::{CacheStats, ResultCache, SimilarityCache};
use crate::config::Config;
use crate::detector::{standard_detectors, Detector, Metadata};
use crate::error::{GateError, Result};
use crate::pool::{Dispatcher, DispatcherStats, TaskPayload};

/// Per-request options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectOptions {
    /// Consult and fill the result cache
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self { use_cache: true }
    }
}

/// How a batch is run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Wait for every item
    #[default]
    Sync,
    /// Return a job id immediately
    Async,
}

/// Batch options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Sync or async
    #[serde(default)]
    pub mode: BatchMode,
    /// Per-item options
    #[serde(default, flatten)]
    pub detect: DetectOptions,
}

/// What `detect_batch` hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchSubmission {
    /// Sync batch, finished
    Sync(BatchOutcome),
    /// Async batch, accepted
    Async {
        /// Poll with `get_status`
        job_id: String,
    },
}

/// Batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Batches accepted
    pub submitted: u64,
    /// Batches refused by the token bucket
    pub rate_limited: u64,
    /// Async jobs still running
    pub active_jobs: usize,
    /// Async jobs held (running or awaiting fetch)
    pub retained_jobs: usize,
    /// Batch items finished
    pub items_processed: u64,
    /// Batch items that failed
    pub items_failed: u64,
    /// Tokens currently in the bucket
    pub tokens_available: u32,
}

/// Everything `get_stats` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStats {
    /// Result cache
    pub cache: CacheStats,
    /// Similarity-search cache
    pub similarity_cache: CacheStats,
    /// Worker pool
    pub pool: DispatcherStats,
    /// Scratch buffers
    pub buffers: BufferStats,
    /// Batches
    pub batch: BatchStats,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rate_limited: AtomicU64,
    items_processed: AtomicU64,
    items_failed: AtomicU64,
}

struct Inner {
    config: Config,
    cache: ResultCache,
    similarity_cache: Arc<SimilarityCache>,
    buffers: Arc<BufferPool>,
    dispatcher: Dispatcher,
    limiter: TokenBucket,
    jobs: JobStore,
    counters: Counters,
}

impl Inner {
    async fn detect(&self, item: BatchItem, options: DetectOptions) -> Result<DetectionResult> {
        let started = Instant::now();
        let max = self.config.max_content_bytes;
        if item.content.len() > max {
            return Err(GateError::PayloadTooLarge {
                size: item.content.len(),
                max,
            });
        }

        let payload = Arc::new(TaskPayload::new(item.content, item.metadata));
        if options.use_cache {
            if let Some(mut hit) = self.cache.get(&payload.fingerprint) {
                hit.cached = true;
                hit.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                tracing::debug!(fingerprint = ?payload.fingerprint, "result cache hit");
                return Ok(hit);
            }
        }

        let result = self.dispatcher.submit(Arc::clone(&payload)).await?;
        if options.use_cache && !result.incomplete {
            self.cache.set(payload.fingerprint, result.clone());
        }
        Ok(result)
    }

    async fn detect_item(&self, index: usize, item: BatchItem, options: DetectOptions) -> BatchItemResult {
        let outcome = match self.detect(item, options).await {
            Ok(result) => BatchItemResult::Success(result),
            Err(e) => {
                tracing::warn!(index, error = %e, "batch item failed");
                self.counters.items_failed.fetch_add(1, Ordering::Relaxed);
                BatchItemResult::failed(index, &e)
            },
        };
        self.counters.items_processed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    async fn run_sync(&self, items: Vec<BatchItem>, options: DetectOptions) -> Vec<BatchItemResult> {
        let mut slots: Vec<Option<BatchItemResult>> = vec![None; items.len()];
        let mut results = futures::stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| async move { (i, self.detect_item(i, item, options).await) })
            .buffer_unordered(self.config.batch.concurrency);

        while let Some((i, result)) = results.next().await {
            slots[i] = Some(result);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    BatchItemResult::failed(i, &GateError::ShuttingDown("batch"))
                })
            })
            .collect()
    }

    async fn run_async(self: Arc<Self>, job_id: String, items: Arc<[BatchItem]>, options: DetectOptions) {
        if !self.jobs.start(&job_id) {
            return;
        }

        let work = futures::stream::iter(items.iter().cloned().enumerate())
            .map(|(i, item)| {
                let inner = &self;
                async move { (i, inner.detect_item(i, item, options).await) }
            })
            .buffer_unordered(self.config.batch.concurrency)
            .for_each(|(i, result)| {
                let recorded = self.jobs.record(&job_id, i, result);
                if !recorded {
                    tracing::debug!(job = %job_id, index = i, "late batch result discarded");
                }
                tokio::task::yield_now()
            });
        work.await;

        if let Some(status) = self
            .jobs
            .complete(&job_id, self.config.batch.partial_failure_fraction)
        {
            tracing::info!(job = %job_id, status = ?status, "batch finished");
        }
    }
}

/// Entry point for detections and batches.
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BatchOrchestrator {
    /// Build with the standard detector stack. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_detectors(config, standard_detectors)
    }

    /// Build with a custom detector set. `build` receives the similarity
    /// cache so a similarity detector can share it.
    pub fn with_detectors<F>(config: Config, build: F) -> Result<Self>
    where
        F: FnOnce(&Config, Arc<SimilarityCache>) -> Vec<Arc<dyn Detector>>,
    {
        config.validate()?;

        let similarity_cache = Arc::new(SimilarityCache::new(&config.similarity_cache));
        let detectors = build(&config, Arc::clone(&similarity_cache));
        let buffers = Arc::new(BufferPool::new(config.buffer_pool.clone())?);
        let dispatcher = Dispatcher::new(
            config.pool.clone(),
            config.aggregation.clone(),
            detectors,
            Arc::clone(&buffers),
        )?;

        let inner = Arc::new(Inner {
            cache: ResultCache::new(&config.cache),
            limiter: TokenBucket::new(&config.batch.rate_limit),
            similarity_cache,
            buffers,
            dispatcher,
            jobs: JobStore::new(),
            counters: Counters::default(),
            config,
        });

        let sweeper = tokio::spawn(sweep(Arc::downgrade(&inner)));

        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Ids of the configured detectors
    pub fn detector_ids(&self) -> Vec<String> {
        self.inner.dispatcher.detector_ids()
    }

    /// Classify one item: result cache first, worker pool on a miss.
    pub async fn detect(&self, item: BatchItem, options: DetectOptions) -> Result<DetectionResult> {
        self.inner.detect(item, options).await
    }

    /// Classify many items.
    ///
    /// Fails up front with `BatchTooLarge` or `RateLimited`; afterwards
    /// per-item failures are reported inline and never fail the batch.
    pub async fn detect_batch(
        &self,
        items: Vec<BatchItem>,
        options: BatchOptions,
    ) -> Result<BatchSubmission> {
        let inner = &self.inner;
        let max = inner.config.batch.max_batch_size;
        if items.len() > max {
            return Err(GateError::BatchTooLarge {
                size: items.len(),
                max,
            });
        }
        if let Err(e) = inner.limiter.try_acquire() {
            inner.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %e, "batch rate limited");
            return Err(e);
        }
        inner.counters.submitted.fetch_add(1, Ordering::Relaxed);

        match options.mode {
            BatchMode::Sync => {
                let results = inner.run_sync(items, options.detect).await;
                let status =
                    BatchStatus::settle(&results, inner.config.batch.partial_failure_fraction);
                tracing::debug!(items = results.len(), status = ?status, "sync batch finished");
                Ok(BatchSubmission::Sync(BatchOutcome { status, results }))
            },
            BatchMode::Async => {
                let job = BatchJob::new(items.into());
                let items = Arc::clone(&job.items);
                let cancel = job.cancel_signal();
                let job_id = inner.jobs.insert(job);
                tracing::info!(job = %job_id, items = items.len(), "async batch accepted");

                let runner = Arc::clone(inner).run_async(job_id.clone(), items, options.detect);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.notified() => {},
                        _ = runner => {},
                    }
                });
                Ok(BatchSubmission::Async { job_id })
            },
        }
    }

    /// Status of an async job. Once a terminal status has been returned the
    /// job is gone and later calls fail with `JobNotFound`.
    pub fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        self.inner.jobs.fetch(job_id)
    }

    /// Cancel an async job, abandoning its in-flight items. Idempotent.
    pub fn cancel_batch(&self, job_id: &str) -> Result<BatchStatus> {
        self.inner.jobs.cancel(job_id)
    }

    /// Counters from every component
    pub fn get_stats(&self) -> GatewayStats {
        let inner = &self.inner;
        let (active_jobs, retained_jobs) = inner.jobs.counts();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GatewayStats {
            cache: inner.cache.stats(),
            similarity_cache: inner.similarity_cache.stats(),
            pool: inner.dispatcher.stats(),
            buffers: inner.buffers.stats(),
            batch: BatchStats {
                submitted: load(&inner.counters.submitted),
                rate_limited: load(&inner.counters.rate_limited),
                active_jobs,
                retained_jobs,
                items_processed: load(&inner.counters.items_processed),
                items_failed: load(&inner.counters.items_failed),
                tokens_available: inner.limiter.available(),
            },
        }
    }

    /// Stop the sweeper, cancel running jobs, drain the workers and free the
    /// buffers. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let cancelled = self.inner.jobs.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled running batches");
        }
        self.inner.dispatcher.shutdown().await;
        self.inner.buffers.shutdown();
    }
}

impl Drop for BatchOrchestrator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Periodic cleanup until the orchestrator is dropped.
async fn sweep(inner: Weak<Inner>) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.batch.sweep_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let jobs = inner.jobs.sweep(inner.config.batch.job_ttl());
        let results = inner.cache.purge_expired();
        let searches = inner.similarity_cache.purge_expired();
        inner.buffers.maintain();
        if jobs + results + searches > 0 {
            tracing::debug!(jobs, results, searches, "sweep");
        }
    }
}

/// Convenience for callers holding bare content.
impl From<&str> for BatchItem {
    fn from(content: &str) -> Self {
        BatchItem::new(content)
    }
}

impl From<(String, Metadata)> for BatchItem {
    fn from((content, metadata): (String, Metadata)) -> Self {
        BatchItem { content, metadata }
    }
}
