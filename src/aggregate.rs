//! Weighted-vote aggregation.
//!
//! ```text
//! confidence = Σ(vote.confidence × weight) / Σ(weight of detectors that voted)
//! detected   = confidence ≥ threshold  ||  any detected vote is critical
//! ```
//!
//! With every configured detector voting, the denominator is the configured
//! weight sum (1.0) and the formula reduces to the plain weighted sum.
//! Detectors that abstain drop out of the denominator. Erroring detectors drop
//! out too under [`DetectorErrorPolicy::Redistribute`], or keep their weight
//! at zero confidence under [`DetectorErrorPolicy::Zero`]. Detectors that miss
//! the task deadline keep their weight at zero confidence and mark the result
//! `incomplete`; under [`FailurePolicy::FailClosed`] they also force
//! `detected = false`.
//!
//! Outcomes are sorted by detector id before summing, so the result is
//! independent of completion order down to the last bit.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Fingerprint;
use crate::config::{AggregationConfig, DetectorErrorPolicy, FailurePolicy};
use crate::detector::{Finding, Severity};
use crate::error::{GateError, Result};

/// How one detector's run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    /// Produced a vote
    Vote(Finding),
    /// Declined: input outside its remit
    Abstained,
    /// Cancelled at the task deadline
    TimedOut,
    /// Returned an error
    Failed(String),
}

/// One detector's contribution to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorVote {
    /// Detector id
    pub detector_id: String,
    /// Reported confidence (0.0 for timed-out or errored detectors)
    pub confidence: f64,
    /// Weight applied
    pub weight: f64,
    /// Whether the detector flagged the content
    pub detected: bool,
    /// Reported category
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Reported severity
    pub severity: Severity,
    /// Supporting evidence
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

/// Final verdict for one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Malicious or not
    pub detected: bool,
    /// Aggregate confidence in `[0, 1]`
    pub confidence: f64,
    /// Categories reported by detectors that flagged the content
    pub categories: BTreeSet<String>,
    /// Per-detector votes, ordered by detector id
    pub votes: Vec<DetectorVote>,
    /// Wall time from submission to verdict
    pub latency_ms: f64,
    /// When the verdict was produced
    pub timestamp: DateTime<Utc>,
    /// Some detector timed out or errored
    pub incomplete: bool,
    /// Detectors cancelled at the deadline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timed_out_detectors: Vec<String>,
    /// Detectors that returned an error
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable_detectors: Vec<String>,
    /// Content fingerprint the verdict is cached under
    pub fingerprint: Fingerprint,
    /// Served from the result cache
    #[serde(default)]
    pub cached: bool,
}

impl DetectionResult {
    /// A complete, negative verdict with no votes
    pub fn benign(fingerprint: Fingerprint) -> Self {
        Self {
            detected: false,
            confidence: 0.0,
            categories: BTreeSet::new(),
            votes: Vec::new(),
            latency_ms: 0.0,
            timestamp: Utc::now(),
            incomplete: false,
            timed_out_detectors: Vec::new(),
            unavailable_detectors: Vec::new(),
            fingerprint,
            cached: false,
        }
    }

    /// Vote from a given detector
    pub fn vote(&self, detector_id: &str) -> Option<&DetectorVote> {
        self.votes.iter().find(|v| v.detector_id == detector_id)
    }
}

/// Folds detector outcomes into a [`DetectionResult`].
#[derive(Debug, Clone)]
pub struct Aggregator {
    config: AggregationConfig,
    failure_policy: FailurePolicy,
}

impl Aggregator {
    /// Create from config
    pub fn new(config: AggregationConfig, failure_policy: FailurePolicy) -> Self {
        Self {
            config,
            failure_policy,
        }
    }

    /// Aggregation settings
    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    fn is_critical(&self, finding: &Finding) -> bool {
        finding.detected
            && (finding.severity == Severity::Critical
                || finding
                    .category
                    .as_ref()
                    .is_some_and(|c| self.config.critical_categories.contains(c)))
    }

    /// Aggregate one task's outcomes.
    ///
    /// Fails with `DetectorUnavailable` when every detector errored, since
    /// there is nothing to base a verdict on.
    pub fn aggregate(
        &self,
        fingerprint: Fingerprint,
        mut outcomes: Vec<(String, DetectorOutcome)>,
    ) -> Result<DetectionResult> {
        if !outcomes.is_empty()
            && outcomes
                .iter()
                .all(|(_, o)| matches!(o, DetectorOutcome::Failed(_)))
        {
            let reasons: Vec<String> = outcomes
                .iter()
                .filter_map(|(id, o)| match o {
                    DetectorOutcome::Failed(reason) => Some(format!("{id}: {reason}")),
                    _ => None,
                })
                .collect();
            return Err(GateError::DetectorUnavailable(reasons.join("; ")));
        }

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut result = DetectionResult::benign(fingerprint);
        let mut weighted = 0.0;
        let mut denominator = 0.0;
        let mut critical = false;

        for (id, outcome) in outcomes {
            let weight = self.config.weight(&id);
            match outcome {
                DetectorOutcome::Vote(finding) => {
                    weighted += finding.confidence * weight;
                    denominator += weight;
                    critical |= self.is_critical(&finding);
                    if finding.detected {
                        if let Some(category) = &finding.category {
                            result.categories.insert(category.clone());
                        }
                    }
                    result.votes.push(DetectorVote {
                        detector_id: id,
                        confidence: finding.confidence,
                        weight,
                        detected: finding.detected,
                        category: finding.category,
                        severity: finding.severity,
                        evidence: finding.evidence,
                    });
                },
                DetectorOutcome::Abstained => {},
                DetectorOutcome::TimedOut => {
                    denominator += weight;
                    result.incomplete = true;
                    result.votes.push(silent_vote(id.clone(), weight));
                    result.timed_out_detectors.push(id);
                },
                DetectorOutcome::Failed(reason) => {
                    tracing::debug!(detector = %id, %reason, "detector failed");
                    result.incomplete = true;
                    if self.config.on_detector_error == DetectorErrorPolicy::Zero {
                        denominator += weight;
                        result.votes.push(silent_vote(id.clone(), weight));
                    }
                    result.unavailable_detectors.push(id);
                },
            }
        }

        result.confidence = if denominator > 0.0 {
            (weighted / denominator).clamp(0.0, 1.0)
        } else {
            0.0
        };
        result.detected = result.confidence >= self.config.threshold || critical;

        if self.failure_policy == FailurePolicy::FailClosed && !result.timed_out_detectors.is_empty() {
            result.detected = false;
        }

        Ok(result)
    }
}

fn silent_vote(detector_id: String, weight: f64) -> DetectorVote {
    DetectorVote {
        detector_id,
        confidence: 0.0,
        weight,
        detected: false,
        category: None,
        severity: Severity::Low,
        evidence: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::content_fingerprint;
    use crate::detector::Metadata;
    use proptest::prelude::*;

    fn fp() -> Fingerprint {
        content_fingerprint("test", &Metadata::new())
    }

    fn three_way() -> Aggregator {
        Aggregator::new(
            AggregationConfig::with_weights([("a", 0.5), ("b", 0.3), ("c", 0.2)], 0.5),
            FailurePolicy::FailOpen,
        )
    }

    fn vote(confidence: f64) -> DetectorOutcome {
        DetectorOutcome::Vote(Finding {
            detected: confidence >= 0.5,
            confidence,
            category: (confidence >= 0.5).then(|| "injection".to_string()),
            severity: Severity::High,
            evidence: Vec::new(),
        })
    }

    fn outcomes(list: Vec<(&str, DetectorOutcome)>) -> Vec<(String, DetectorOutcome)> {
        list.into_iter().map(|(id, o)| (id.to_string(), o)).collect()
    }

    #[test]
    fn test_weighted_sum() {
        let result = three_way()
            .aggregate(fp(), outcomes(vec![("a", vote(0.9)), ("b", vote(0.1)), ("c", vote(0.0))]))
            .unwrap();

        assert!((result.confidence - 0.48).abs() < 1e-9);
        assert!(!result.detected);
        assert!(!result.incomplete);
        let ids: Vec<&str> = result.votes.iter().map(|v| v.detector_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(result.categories.iter().collect::<Vec<_>>(), ["injection"]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // Binary-exact weights so the sum lands on the threshold exactly
        let agg = Aggregator::new(
            AggregationConfig::with_weights([("a", 0.5), ("b", 0.25), ("c", 0.25)], 0.5),
            FailurePolicy::FailOpen,
        );
        let result = agg
            .aggregate(fp(), outcomes(vec![("a", vote(0.5)), ("b", vote(0.5)), ("c", vote(0.5))]))
            .unwrap();
        assert_eq!(result.confidence, 0.5);
        assert!(result.detected);
    }

    #[test]
    fn test_critical_vote_forces_detection() {
        let critical = DetectorOutcome::Vote(
            Finding::threat(0.2, "exfil", Severity::Critical),
        );
        let result = three_way()
            .aggregate(fp(), outcomes(vec![("a", vote(0.0)), ("b", vote(0.0)), ("c", critical)]))
            .unwrap();
        assert!(result.confidence < 0.1);
        assert!(result.detected);

        // Critical by configured category, whatever the reported severity
        let jailbreak = DetectorOutcome::Vote(Finding::threat(0.3, "jailbreak", Severity::Medium));
        let result = three_way().aggregate(fp(), outcomes(vec![("c", jailbreak)])).unwrap();
        assert!(result.detected);
    }

    #[test]
    fn test_abstain_redistributes_weight() {
        let result = three_way()
            .aggregate(fp(), outcomes(vec![("a", vote(0.9)), ("b", vote(0.6)), ("c", DetectorOutcome::Abstained)]))
            .unwrap();
        // (0.45 + 0.18) / 0.8
        assert!((result.confidence - 0.7875).abs() < 1e-9);
        assert_eq!(result.votes.len(), 2);
        assert!(!result.incomplete);
    }

    #[test]
    fn test_failed_detector_policies() {
        let list = || outcomes(vec![("a", vote(0.8)), ("b", DetectorOutcome::Failed("down".into()))]);

        let redistribute = three_way();
        let result = redistribute.aggregate(fp(), list()).unwrap();
        assert!((result.confidence - 0.8).abs() < 1e-9);
        assert!(result.incomplete);
        assert_eq!(result.unavailable_detectors, ["b"]);

        let mut config = AggregationConfig::with_weights([("a", 0.5), ("b", 0.3), ("c", 0.2)], 0.5);
        config.on_detector_error = DetectorErrorPolicy::Zero;
        let result = Aggregator::new(config, FailurePolicy::FailOpen).aggregate(fp(), list()).unwrap();
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_all_failed_is_an_error() {
        let err = three_way()
            .aggregate(
                fp(),
                outcomes(vec![("a", DetectorOutcome::Failed("x".into())), ("b", DetectorOutcome::Failed("y".into()))]),
            )
            .unwrap_err();
        assert!(matches!(err, GateError::DetectorUnavailable(_)));
    }

    #[test]
    fn test_timeout_policies() {
        let list = || outcomes(vec![("a", vote(0.9)), ("b", vote(0.9)), ("c", DetectorOutcome::TimedOut)]);

        let open = three_way().aggregate(fp(), list()).unwrap();
        assert!((open.confidence - 0.72).abs() < 1e-9);
        assert!(open.detected);
        assert!(open.incomplete);
        assert_eq!(open.timed_out_detectors, ["c"]);

        let closed = Aggregator::new(three_way().config().clone(), FailurePolicy::FailClosed)
            .aggregate(fp(), list())
            .unwrap();
        assert!(!closed.detected);
        assert!(closed.incomplete);
    }

    #[test]
    fn test_nothing_voted() {
        let result = three_way()
            .aggregate(fp(), outcomes(vec![("a", DetectorOutcome::Abstained)]))
            .unwrap();
        assert_eq!(result.confidence, 0.0);
        assert!(!result.detected);
    }

    proptest! {
        #[test]
        fn prop_aggregation_is_order_independent(
            confs in proptest::collection::vec(0.0f64..=1.0, 3),
            rotate in 0usize..3,
        ) {
            let ids = ["a", "b", "c"];
            let forward: Vec<(String, DetectorOutcome)> =
                ids.iter().zip(&confs).map(|(id, c)| (id.to_string(), vote(*c))).collect();
            let mut shuffled = forward.clone();
            shuffled.rotate_left(rotate);
            shuffled.reverse();

            let agg = three_way();
            let x = agg.aggregate(fp(), forward).unwrap();
            let y = agg.aggregate(fp(), shuffled).unwrap();
            prop_assert_eq!(x.confidence.to_bits(), y.confidence.to_bits());
            prop_assert_eq!(x.detected, y.detected);
            prop_assert_eq!(x.votes, y.votes);
        }
    }
}
