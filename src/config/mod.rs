//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`THREATGATE_*`)
//! - CLI arguments (for the binary)
//!
//! Every section has a usable default, so an empty file is a valid config.
//! Call [`Config::validate`] before building a gateway; construction paths in
//! this crate do it for you.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};

/// Detector ids used by the default detector stack.
pub const PATTERN_DETECTOR: &str = "pattern";
/// Similarity detector id.
pub const SIMILARITY_DETECTOR: &str = "similarity";
/// Structural detector id.
pub const STRUCTURAL_DETECTOR: &str = "structural";
/// Multimodal detector id.
pub const MULTIMODAL_DETECTOR: &str = "multimodal";

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Result cache (completed verdicts)
    #[serde(default)]
    pub cache: CacheConfig,

    /// Similarity cache (similarity-search responses)
    #[serde(default = "CacheConfig::similarity_default")]
    pub similarity_cache: CacheConfig,

    /// Worker pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Scratch buffer pool
    #[serde(default)]
    pub buffer_pool: BufferPoolConfig,

    /// Batch orchestration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Vote aggregation
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Similarity detector query parameters
    #[serde(default)]
    pub similarity: SimilarityConfig,

    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Maximum content size accepted for scanning (bytes)
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,
}

fn default_max_content_bytes() -> usize {
    1024 * 1024 // 1MB
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            similarity_cache: CacheConfig::similarity_default(),
            pool: PoolConfig::default(),
            buffer_pool: BufferPoolConfig::default(),
            batch: BatchConfig::default(),
            aggregation: AggregationConfig::default(),
            similarity: SimilarityConfig::default(),
            server: ServerConfig::default(),
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GateError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| GateError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `THREATGATE_*` environment overrides on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Some(val) = parsed("THREATGATE_WORKERS") {
            self.pool.worker_count = val;
        }
        if let Some(val) = parsed("THREATGATE_QUEUE_DEPTH") {
            self.pool.queue_depth_per_worker = val;
        }
        if let Some(val) = parsed("THREATGATE_TASK_TIMEOUT_MS") {
            self.pool.task_timeout_ms = val;
        }
        if let Ok(val) = std::env::var("THREATGATE_FAILURE_POLICY") {
            match val.as_str() {
                "fail-open" => self.pool.failure_policy = FailurePolicy::FailOpen,
                "fail-closed" => self.pool.failure_policy = FailurePolicy::FailClosed,
                other => tracing::warn!("Ignoring unknown THREATGATE_FAILURE_POLICY {other:?}"),
            }
        }
        if let Some(val) = parsed("THREATGATE_CACHE_MAX_SIZE") {
            self.cache.max_size = val;
        }
        if let Some(val) = parsed("THREATGATE_CACHE_TTL_MS") {
            self.cache.ttl_ms = val;
        }
        if let Some(val) = parsed("THREATGATE_MAX_BUFFERS") {
            self.buffer_pool.max_buffers = val;
        }
        if let Some(val) = parsed("THREATGATE_MAX_BATCH_SIZE") {
            self.batch.max_batch_size = val;
        }
        if let Some(val) = parsed("THREATGATE_THRESHOLD") {
            self.aggregation.threshold = val;
        }
        if let Ok(host) = std::env::var("THREATGATE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed("THREATGATE_PORT") {
            self.server.port = port;
        }

        self
    }

    /// Default config file location (`$XDG_CONFIG_HOME/threatgate/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("threatgate").join("config.toml"))
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        self.cache.validate("cache")?;
        self.similarity_cache.validate("similarity_cache")?;
        self.pool.validate()?;
        self.buffer_pool.validate()?;
        self.batch.validate()?;
        self.aggregation.validate()?;
        self.similarity.validate()?;

        // Every worker holds one scratch buffer while it runs a task
        if self.buffer_pool.max_buffers < self.pool.worker_count {
            return Err(GateError::Config(format!(
                "buffer_pool.max_buffers ({}) must be at least pool.worker_count ({})",
                self.buffer_pool.max_buffers, self.pool.worker_count
            )));
        }

        let largest = self.buffer_pool.largest_class();
        if self.max_content_bytes == 0 || self.max_content_bytes > largest {
            return Err(GateError::Config(format!(
                "max_content_bytes ({}) must be in 1..={largest} (largest buffer size class)",
                self.max_content_bytes
            )));
        }

        Ok(())
    }
}

/// LRU + TTL cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,

    /// Entry time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl_ms: 5 * 60 * 1000, // 5 minutes
        }
    }
}

impl CacheConfig {
    /// Defaults for the similarity cache (smaller, shorter-lived)
    pub fn similarity_default() -> Self {
        Self {
            max_size: 4_096,
            ttl_ms: 60 * 1000,
        }
    }

    /// Create with explicit capacity and TTL
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_size == 0 {
            return Err(GateError::Config(format!("{section}.max_size must be > 0")));
        }
        if self.ttl_ms == 0 {
            return Err(GateError::Config(format!("{section}.ttl_ms must be > 0")));
        }
        Ok(())
    }
}

/// What a task that outruns its deadline reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Late detectors contribute zero confidence; the verdict stands on the rest.
    #[default]
    FailOpen,
    /// Any late detector forces `detected = false`.
    FailClosed,
}

/// What happens to the task a worker was running when it faulted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPolicy {
    /// Report the task as failed.
    #[default]
    Fail,
    /// Hand the task to another worker once, then fail.
    RedispatchOnce,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers
    pub worker_count: usize,

    /// Bounded queue depth per worker
    pub queue_depth_per_worker: usize,

    /// Per-task deadline in milliseconds
    pub task_timeout_ms: u64,

    /// Deadline policy
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Worker fault policy
    #[serde(default)]
    pub fault_policy: FaultPolicy,

    /// Bounded wait on a full queue before `QueueFull` (0 = fail fast)
    #[serde(default)]
    pub submit_wait_ms: u64,

    /// First respawn delay after a worker fault
    #[serde(default = "default_backoff_base_ms")]
    pub respawn_backoff_base_ms: u64,

    /// Respawn delay ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub respawn_backoff_max_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            queue_depth_per_worker: 64,
            task_timeout_ms: 250,
            failure_policy: FailurePolicy::default(),
            fault_policy: FaultPolicy::default(),
            submit_wait_ms: 0,
            respawn_backoff_base_ms: default_backoff_base_ms(),
            respawn_backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PoolConfig {
    /// Set worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Set per-worker queue depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth_per_worker = depth;
        self
    }

    /// Set task timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set deadline policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set worker fault policy
    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    /// Set how long `submit` waits on a full queue (zero fails fast)
    pub fn with_submit_wait(mut self, wait: Duration) -> Self {
        self.submit_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Task timeout as a duration
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Bounded submit wait, if enabled
    pub fn submit_wait(&self) -> Option<Duration> {
        (self.submit_wait_ms > 0).then(|| Duration::from_millis(self.submit_wait_ms))
    }

    fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(GateError::Config("pool.worker_count must be > 0".into()));
        }
        if self.queue_depth_per_worker == 0 {
            return Err(GateError::Config(
                "pool.queue_depth_per_worker must be > 0".into(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(GateError::Config("pool.task_timeout_ms must be > 0".into()));
        }
        if self.respawn_backoff_base_ms > self.respawn_backoff_max_ms {
            return Err(GateError::Config(
                "pool.respawn_backoff_base_ms must be <= respawn_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Behavior when every buffer is checked out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Return `PoolExhausted` immediately.
    #[default]
    Fail,
    /// Wait up to `acquire_timeout_ms` for a release.
    Wait,
}

/// Scratch buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Buffer byte lengths, strictly ascending
    pub size_classes: Vec<usize>,

    /// Ceiling on buffers across all classes
    pub max_buffers: usize,

    /// Buffers preallocated per class, and the shrink floor
    #[serde(default = "default_min_buffers")]
    pub min_buffers: usize,

    /// Exhaustion behavior
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,

    /// Wait bound for `ExhaustionPolicy::Wait`
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Consecutive low-utilization checks before shrinking
    #[serde(default = "default_shrink_after_checks")]
    pub shrink_after_checks: u32,

    /// Utilization (in_use / allocated) below which a check counts as low
    #[serde(default = "default_low_utilization")]
    pub low_utilization: f64,
}

fn default_min_buffers() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    5
}

fn default_shrink_after_checks() -> u32 {
    8
}

fn default_low_utilization() -> f64 {
    0.25
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            size_classes: vec![4 * 1024, 64 * 1024, 1024 * 1024],
            max_buffers: 256,
            min_buffers: default_min_buffers(),
            exhaustion: ExhaustionPolicy::default(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            shrink_after_checks: default_shrink_after_checks(),
            low_utilization: default_low_utilization(),
        }
    }
}

impl BufferPoolConfig {
    /// Largest configured class
    pub fn largest_class(&self) -> usize {
        self.size_classes.last().copied().unwrap_or(0)
    }

    /// Acquire wait bound as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.size_classes.is_empty() {
            return Err(GateError::Config(
                "buffer_pool.size_classes must not be empty".into(),
            ));
        }
        if self.size_classes[0] == 0 || self.size_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GateError::Config(
                "buffer_pool.size_classes must be non-zero and strictly ascending".into(),
            ));
        }
        if self.max_buffers == 0 {
            return Err(GateError::Config("buffer_pool.max_buffers must be > 0".into()));
        }
        if self.min_buffers.saturating_mul(self.size_classes.len()) > self.max_buffers {
            return Err(GateError::Config(format!(
                "buffer_pool.min_buffers ({}) x {} classes exceeds max_buffers ({})",
                self.min_buffers,
                self.size_classes.len(),
                self.max_buffers
            )));
        }
        if !(0.0..=1.0).contains(&self.low_utilization) {
            return Err(GateError::Config(
                "buffer_pool.low_utilization must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Token bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (and refill amount per window)
    pub tokens: u32,

    /// Refill window in milliseconds
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens: 100,
            window_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    /// Refill window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Batch orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum items per batch
    pub max_batch_size: usize,

    /// Batch submission rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Items in flight per batch
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,

    /// Async job retention in milliseconds
    #[serde(default = "default_job_ttl_ms")]
    pub job_ttl_ms: u64,

    /// Failed fraction above which a batch is `PartiallyFailed`
    #[serde(default)]
    pub partial_failure_fraction: f64,

    /// Background sweep period for expired jobs and cache entries
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_batch_concurrency() -> usize {
    8
}

fn default_job_ttl_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_sweep_interval_ms() -> u64 {
    30 * 1000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            rate_limit: RateLimitConfig::default(),
            concurrency: default_batch_concurrency(),
            job_ttl_ms: default_job_ttl_ms(),
            partial_failure_fraction: 0.0,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl BatchConfig {
    /// Async job TTL as a duration
    pub fn job_ttl(&self) -> Duration {
        Duration::from_millis(self.job_ttl_ms)
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(GateError::Config("batch.max_batch_size must be > 0".into()));
        }
        if self.rate_limit.tokens == 0 || self.rate_limit.window_ms == 0 {
            return Err(GateError::Config(
                "batch.rate_limit tokens and window_ms must be > 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(GateError::Config("batch.concurrency must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.partial_failure_fraction) {
            return Err(GateError::Config(
                "batch.partial_failure_fraction must be within 0.0..=1.0".into(),
            ));
        }
        if self.job_ttl_ms == 0 || self.sweep_interval_ms == 0 {
            return Err(GateError::Config(
                "batch.job_ttl_ms and sweep_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// What an erroring detector's weight does
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorErrorPolicy {
    /// Drop the weight; remaining weights are renormalized.
    #[default]
    Redistribute,
    /// Keep the weight with zero confidence.
    Zero,
}

/// Vote aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Per-detector weight, must sum to 1.0
    pub weights: BTreeMap<String, f64>,

    /// Aggregate confidence at or above which content is flagged
    pub threshold: f64,

    /// Erroring-detector policy
    #[serde(default)]
    pub on_detector_error: DetectorErrorPolicy,

    /// Categories treated as critical whatever severity the detector reports
    #[serde(default = "default_critical_categories")]
    pub critical_categories: Vec<String>,
}

fn default_critical_categories() -> Vec<String> {
    vec!["jailbreak".to_string()]
}

impl Default for AggregationConfig {
    fn default() -> Self {
        let weights = [
            (PATTERN_DETECTOR, 0.35),
            (SIMILARITY_DETECTOR, 0.30),
            (STRUCTURAL_DETECTOR, 0.20),
            (MULTIMODAL_DETECTOR, 0.15),
        ]
        .into_iter()
        .map(|(id, w)| (id.to_string(), w))
        .collect();

        Self {
            weights,
            threshold: 0.5,
            on_detector_error: DetectorErrorPolicy::default(),
            critical_categories: default_critical_categories(),
        }
    }
}

impl AggregationConfig {
    /// Build from explicit weights
    pub fn with_weights<I, S>(weights: I, threshold: f64) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            weights: weights.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            threshold,
            ..Self::default()
        }
    }

    /// Weight for a detector (0.0 when not configured)
    pub fn weight(&self, detector_id: &str) -> f64 {
        self.weights.get(detector_id).copied().unwrap_or(0.0)
    }

    fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(GateError::Config("aggregation.weights must not be empty".into()));
        }
        if let Some((id, w)) = self.weights.iter().find(|(_, w)| !(0.0..=1.0).contains(*w)) {
            return Err(GateError::Config(format!(
                "aggregation.weights.{id} = {w} is outside 0.0..=1.0"
            )));
        }
        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(GateError::Config(format!(
                "aggregation.weights must sum to 1.0 (got {sum})"
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(GateError::Config(
                "aggregation.threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Similarity detector query parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Neighbors requested per query
    pub top_k: usize,

    /// Minimum score for a neighbor to count
    pub score_threshold: f32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.6,
        }
    }
}

impl SimilarityConfig {
    fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(GateError::Config("similarity.top_k must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(GateError::Config(
                "similarity.score_threshold must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_size: default_max_body_size(),
        }
    }
}

impl ServerConfig {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.pool.failure_policy, FailurePolicy::FailOpen);
        assert!((config.aggregation.weights.values().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            max_content_bytes = 4096

            [cache]
            max_size = 500
            ttl_ms = 1000

            [pool]
            worker_count = 3
            queue_depth_per_worker = 8
            task_timeout_ms = 20
            failure_policy = "fail-closed"
            fault_policy = "redispatch-once"

            [buffer_pool]
            size_classes = [1024, 4096]
            max_buffers = 16
            exhaustion = "wait"

            [batch]
            max_batch_size = 50
            rate_limit = { tokens = 5, window_ms = 100 }

            [aggregation]
            threshold = 0.6
            weights = { pattern = 0.5, similarity = 0.3, structural = 0.2 }
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.max_size, 500);
        assert_eq!(config.pool.worker_count, 3);
        assert_eq!(config.pool.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.pool.fault_policy, FaultPolicy::RedispatchOnce);
        assert_eq!(config.buffer_pool.exhaustion, ExhaustionPolicy::Wait);
        assert_eq!(config.batch.rate_limit.tokens, 5);
        assert_eq!(config.aggregation.weight("pattern"), 0.5);
        assert_eq!(config.aggregation.weight("multimodal"), 0.0);
        // Unspecified sections keep their defaults
        assert_eq!(config.similarity_cache.max_size, 4_096);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[pool]\nworker_count = 2\nqueue_depth_per_worker = 4\ntask_timeout_ms = 100\n").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pool.worker_count, 2);
        assert!(Config::from_file("/nonexistent/threatgate.toml").is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.aggregation = AggregationConfig::with_weights([("pattern", 0.5), ("similarity", 0.3)], 0.5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_size_classes_must_ascend() {
        let mut config = Config::default();
        config.buffer_pool.size_classes = vec![4096, 1024];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_pool_must_cover_workers() {
        let mut config = Config::default();
        config.pool.worker_count = 8;
        config.buffer_pool.min_buffers = 0;
        config.buffer_pool.max_buffers = 7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool.worker_count"));

        config.buffer_pool.max_buffers = 8;
        config.validate().unwrap();
    }

    #[test]
    fn test_max_content_must_fit_buffers() {
        let mut config = Config::default();
        config.max_content_bytes = config.buffer_pool.largest_class() + 1;
        assert!(config.validate().is_err());
    }
}
