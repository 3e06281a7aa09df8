//! Signature detector over compiled regex tables.
//!
//! The tables below are illustrative: they catch common prompt-injection,
//! jailbreak, malformed-payload and exfiltration phrasing. They are compiled
//! once per process and shared read-only by every worker.

use lazy_static::lazy_static;
use regex::Regex;

use super::{BoxFuture, DetectionInput, Detector, Finding, Severity, Verdict};
use crate::config::PATTERN_DETECTOR;

/// A threat signature
#[derive(Debug, Clone)]
pub struct Signature {
    /// Signature name, reported as evidence
    pub name: &'static str,
    /// Regex source
    pub pattern: &'static str,
    /// Threat category
    pub category: ThreatCategory,
    /// Confidence when matched (0.0 - 1.0)
    pub confidence: f64,
    /// Severity when matched
    pub severity: Severity,
}

/// Threat categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreatCategory {
    /// Prompt injection
    Injection,
    /// Jailbreak attempt
    Jailbreak,
    /// Malformed payload
    Malformed,
    /// Data exfiltration
    DataExfil,
    /// Privilege escalation
    PrivilegeEsc,
}

impl ThreatCategory {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Injection => "injection",
            ThreatCategory::Jailbreak => "jailbreak",
            ThreatCategory::Malformed => "malformed",
            ThreatCategory::DataExfil => "data_exfil",
            ThreatCategory::PrivilegeEsc => "privilege_esc",
        }
    }
}

impl std::fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn sig(
    name: &'static str,
    pattern: &'static str,
    category: ThreatCategory,
    confidence: f64,
    severity: Severity,
) -> Signature {
    Signature {
        name,
        pattern,
        category,
        confidence,
        severity,
    }
}

use self::ThreatCategory::{DataExfil, Injection, Jailbreak, Malformed, PrivilegeEsc};

/// Built-in signature table
pub static SIGNATURES: &[Signature] = &[
    // Injection
    sig(
        "ignore_instructions",
        r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions?|prompts?|rules?)",
        Injection,
        0.9,
        Severity::High,
    ),
    sig(
        "disregard_instructions",
        r"(?i)disregard\s+(all\s+)?(your\s+|the\s+)?(previous|prior|above)?\s*(instructions?|prompts?|rules?)",
        Injection,
        0.9,
        Severity::High,
    ),
    sig(
        "forget_instructions",
        r"(?i)forget\s+(your|all|previous)\s+(instructions?|rules?|training)",
        Injection,
        0.85,
        Severity::High,
    ),
    sig(
        "new_instructions",
        r"(?i)your\s+new\s+(instructions?|rules?|role)\s+(are|is|:)",
        Injection,
        0.85,
        Severity::High,
    ),
    sig(
        "system_prompt_extract",
        r"(?i)(show|reveal|print|output|repeat|display)\s+(me\s+)?(your\s+)?(hidden\s+)?(system\s+)?(prompt|instructions)",
        Injection,
        0.8,
        Severity::Medium,
    ),
    sig(
        "fake_system",
        r"(?im)^\s*\[?system\]?\s*[:\-]",
        Injection,
        0.85,
        Severity::High,
    ),
    sig(
        "role_override",
        r"(?i)you\s+are\s+(now|actually)\s+(a|an|the)\s+",
        Injection,
        0.7,
        Severity::Medium,
    ),
    sig(
        "pretend_mode",
        r"(?i)(pretend|act|behave)\s+(you\s+)?(are|as\s+if|like)\s+(you\s+)?(are\s+)?(a|an|the)?\s*(unrestricted|unfiltered|evil)",
        Injection,
        0.9,
        Severity::High,
    ),
    // Jailbreak
    sig(
        "dan_mode",
        r"(?i)\bdan\s+mode\b|do\s+anything\s+now",
        Jailbreak,
        0.95,
        Severity::Critical,
    ),
    sig(
        "developer_mode",
        r"(?i)(enter|enable|activate)\s+(developer|dev)\s+mode",
        Jailbreak,
        0.9,
        Severity::Critical,
    ),
    sig(
        "jailbreak_explicit",
        r"(?i)\bjail\s*break",
        Jailbreak,
        0.85,
        Severity::High,
    ),
    sig(
        "bypass_explicit",
        r"(?i)bypass\s+(all\s+)?(the\s+|your\s+)?(safety|content|ethical|security)\s+(filters?|restrictions?|guidelines?)",
        Jailbreak,
        0.9,
        Severity::Critical,
    ),
    sig(
        "unrestricted_mode",
        r"(?i)(unrestricted|unfiltered|uncensored|unethical)\s+mode",
        Jailbreak,
        0.9,
        Severity::High,
    ),
    sig(
        "no_limits",
        r"(?i)\b(no|without|remove\s+all|remove)\s+(limits|restrictions|boundaries|constraints)\b",
        Jailbreak,
        0.75,
        Severity::Medium,
    ),
    sig(
        "evil_mode",
        r"(?i)\b(evil|malicious)\s+(mode|assistant|ai)\b",
        Jailbreak,
        0.9,
        Severity::High,
    ),
    // Malformed
    sig("null_bytes", r"\\u0000|\x00", Malformed, 0.95, Severity::High),
    sig(
        "excessive_nesting",
        r"\{\s*\{\s*\{\s*\{\s*\{",
        Malformed,
        0.8,
        Severity::Medium,
    ),
    sig(
        "unicode_override",
        r"\\u202[a-e]|\\u200[b-f]|[\u{202A}-\u{202E}\u{2066}-\u{2069}]",
        Malformed,
        0.85,
        Severity::High,
    ),
    // Exfiltration
    sig(
        "env_access",
        r"(?i:process\.env|os\.environ|getenv\s*\()|\$\{[A-Z_][A-Z0-9_]*\}",
        DataExfil,
        0.85,
        Severity::High,
    ),
    sig(
        "file_read",
        r"(?i)(read|cat|type|print|show)\s+(the\s+)?(contents\s+of\s+)?(/etc/passwd|/etc/shadow|\.env\b|credentials)",
        DataExfil,
        0.9,
        Severity::High,
    ),
    // Privilege escalation
    sig(
        "grant_privileges",
        r"(?i)(grant|give)\s+(me\s+)?(admin|root|superuser)\s+(access|privileges?|rights)",
        PrivilegeEsc,
        0.8,
        Severity::High,
    ),
    sig(
        "sudo_mode",
        r"(?i)\b(sudo\s+mode|god\s+mode|admin\s+override)\b",
        PrivilegeEsc,
        0.75,
        Severity::Medium,
    ),
];

lazy_static! {
    /// Compiled signature table
    static ref COMPILED: Vec<(Regex, &'static Signature)> = SIGNATURES
        .iter()
        .filter_map(|s| match Regex::new(s.pattern) {
            Ok(regex) => Some((regex, s)),
            Err(e) => {
                tracing::error!(signature = s.name, "signature failed to compile: {e}");
                None
            },
        })
        .collect();
}

/// Match content against every compiled signature
pub fn match_signatures(content: &str) -> Vec<&'static Signature> {
    COMPILED
        .iter()
        .filter(|(regex, _)| regex.is_match(content))
        .map(|(_, sig)| *sig)
        .collect()
}

/// Fold matched signatures into one vote: the strongest match sets
/// confidence and category, severity is the highest seen.
pub(crate) fn finding_from(matches: &[&'static Signature], evidence_prefix: &str) -> Finding {
    let Some(best) = matches.iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence)) else {
        return Finding::clean();
    };
    let severity = matches
        .iter()
        .map(|s| s.severity)
        .max()
        .unwrap_or(best.severity);

    Finding::threat(best.confidence, best.category.as_str(), severity).with_evidence(
        matches
            .iter()
            .map(|s| format!("{evidence_prefix}{}", s.name))
            .collect(),
    )
}

/// Regex signature detector.
///
/// Runs against the raw content so control characters and line structure
/// survive; every signature is case-insensitive where it matters.
#[derive(Debug, Default)]
pub struct PatternDetector;

impl PatternDetector {
    /// Create, compiling the signature table if this is the first use
    pub fn new() -> Self {
        lazy_static::initialize(&COMPILED);
        Self
    }

    /// Signatures that compiled
    pub fn signature_count(&self) -> usize {
        COMPILED.len()
    }
}

impl Detector for PatternDetector {
    fn id(&self) -> &str {
        PATTERN_DETECTOR
    }

    fn analyze<'a>(&'a self, input: &'a DetectionInput<'a>) -> BoxFuture<'a, Verdict> {
        Box::pin(async move {
            let matches = match_signatures(input.content);
            Ok(Verdict::Vote(finding_from(&matches, "")))
        })
    }
}
