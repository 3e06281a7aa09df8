//! Pluggable threat detectors.
//!
//! Every detector exposes one capability, [`Detector::analyze`], and the
//! dispatcher treats the configured set polymorphically as
//! `Vec<Arc<dyn Detector>>`. A detector answers with a [`Verdict`]: either a
//! [`Finding`] (a vote, possibly "nothing found") or [`Verdict::Abstain`] when
//! the input is outside its remit. Abstaining removes the detector's weight
//! from the aggregate instead of dragging the confidence down.
//!
//! # Standard Stack
//!
//! | Detector               | Id           | Looks at                                  |
//! |------------------------|--------------|-------------------------------------------|
//! | [`PatternDetector`]    | `pattern`    | raw content vs compiled signature tables  |
//! | [`SimilarityDetector`] | `similarity` | embedding neighbours of the normalized text |
//! | [`StructuralDetector`] | `structural` | JSON shape, role delimiters, control chars |
//! | [`MultimodalDetector`] | `multimodal` | `metadata.attachments`                    |
//!
//! # Usage
//!
//! ```rust,ignore
//! use threatgate::detector::{DetectionInput, Detector, Metadata, PatternDetector};
//!
//! let detector = PatternDetector::new();
//! let meta = Metadata::new();
//! let input = DetectionInput::new("Enable DAN mode", "enable dan mode", &meta);
//! let verdict = detector.analyze(&input).await?;
//! ```

mod multimodal;
mod pattern;
mod similarity;
mod structural;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::SimilarityCache;
use crate::config::Config;
use crate::error::Result;

pub use multimodal::MultimodalDetector;
pub use pattern::{match_signatures, PatternDetector, Signature, ThreatCategory};
pub use similarity::{
    HashingEmbedder, InMemoryIndex, SimilarityDetector, ATTACK_EXEMPLARS,
    DEFAULT_EMBEDDING_DIMS,
};
pub use structural::StructuralDetector;

/// Request metadata. Keys are sorted, which keeps fingerprints canonical.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Severity attached to a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    #[default]
    Low,
    /// Suspicious
    Medium,
    /// Likely malicious
    High,
    /// Forces a positive verdict regardless of aggregate confidence
    Critical,
}

impl Severity {
    /// Parse a lowercase name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// What a detector sees.
///
/// `normalized` is the lowercased, whitespace-collapsed form of `content`,
/// produced once per task in pooled scratch memory.
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    /// Content as submitted
    pub content: &'a str,
    /// Normalized content
    pub normalized: &'a str,
    /// Request metadata
    pub metadata: &'a Metadata,
}

impl<'a> DetectionInput<'a> {
    /// Bundle input parts
    pub fn new(content: &'a str, normalized: &'a str, metadata: &'a Metadata) -> Self {
        Self {
            content,
            normalized,
            metadata,
        }
    }
}

/// A detector's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Whether this detector considers the content malicious
    pub detected: bool,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Threat category, when something was found
    pub category: Option<String>,
    /// Severity of the strongest signal
    pub severity: Severity,
    /// Human-readable evidence (signature names, neighbour ids, ...)
    pub evidence: Vec<String>,
}

impl Finding {
    /// Nothing found
    pub fn clean() -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            category: None,
            severity: Severity::Low,
            evidence: Vec::new(),
        }
    }

    /// A positive finding
    pub fn threat(confidence: f64, category: impl Into<String>, severity: Severity) -> Self {
        Self {
            detected: true,
            confidence: confidence.clamp(0.0, 1.0),
            category: Some(category.into()),
            severity,
            evidence: Vec::new(),
        }
    }

    /// Attach evidence
    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }
}

/// Result of [`Detector::analyze`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The detector voted
    Vote(Finding),
    /// Input is outside this detector's remit
    Abstain,
}

/// A single detection strategy.
pub trait Detector: Send + Sync {
    /// Stable id, used to look up the aggregation weight
    fn id(&self) -> &str;

    /// Analyze one input
    fn analyze<'a>(&'a self, input: &'a DetectionInput<'a>) -> BoxFuture<'a, Verdict>;
}

/// One ranked similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Indexed item id
    pub id: String,
    /// Cosine similarity
    pub score: f32,
    /// Item metadata (`category`, `severity`, ...)
    pub metadata: Metadata,
}

/// Nearest-neighbour search over embedded exemplars.
pub trait SimilaritySearch: Send + Sync {
    /// Up to `top_k` hits scoring at least `score_threshold`, best first.
    /// Every key/value in `filters` must match the hit's metadata.
    fn search<'a>(
        &'a self,
        embedding: &'a [f32],
        top_k: usize,
        score_threshold: f32,
        filters: &'a Metadata,
    ) -> BoxFuture<'a, Vec<SearchHit>>;
}

/// Text to vector.
pub trait Embedder: Send + Sync {
    /// Embed text
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Output width
    fn dimensions(&self) -> usize;
}

/// Build the four standard detectors.
///
/// The similarity detector shares `similarity_cache` with the caller, and its
/// index is seeded with [`ATTACK_EXEMPLARS`].
pub fn standard_detectors(
    config: &Config,
    similarity_cache: Arc<SimilarityCache>,
) -> Vec<Arc<dyn Detector>> {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let index: Arc<dyn SimilaritySearch> =
        Arc::new(InMemoryIndex::with_exemplars(embedder.as_ref()));

    vec![
        Arc::new(PatternDetector::new()),
        Arc::new(SimilarityDetector::new(
            embedder,
            index,
            similarity_cache,
            config.similarity.clone(),
        )),
        Arc::new(StructuralDetector::new()),
        Arc::new(MultimodalDetector::new()),
    ]
}
