//! Stable fingerprints for cache keys.
//!
//! Content fingerprints hash the *normalized* text (ASCII-lowercased,
//! whitespace runs collapsed to one space, trimmed) together with the
//! canonical JSON form of the request metadata. Two requests that differ only
//! in case or spacing share a verdict.
//!
//! Similarity-query fingerprints hash a bounded, evenly strided sample of the
//! query vector rather than the full vector. Near-duplicate vectors that agree
//! on every sampled component collide; that is accepted in exchange for a
//! hashing cost independent of embedding width.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::detector::Metadata;

/// Number of vector components sampled for a similarity fingerprint.
pub const SIMILARITY_SAMPLE: usize = 32;

/// Quantization scale applied to sampled components.
const QUANTIZE_SCALE: f32 = 4096.0;

/// A 256-bit BLAKE3 fingerprint. Serializes as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        blake3::Hash::from_hex(hex.as_bytes())
            .map(|hash| Fingerprint(*hash.as_bytes()))
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable
        write!(f, "Fingerprint({}…)", &self.to_hex()[..12])
    }
}

/// Normalize `content` into `out`, returning the normalized length.
///
/// Normalization never grows the text, so `out.len() >= content.len()` always
/// suffices. Returns `None` when `out` is shorter than `content`.
pub fn normalize_into(content: &str, out: &mut [u8]) -> Option<usize> {
    if out.len() < content.len() {
        return None;
    }

    let mut len = 0;
    let mut pending_space = false;
    for ch in content.chars() {
        if ch.is_whitespace() {
            pending_space = len > 0;
            continue;
        }
        if pending_space {
            out[len] = b' ';
            len += 1;
            pending_space = false;
        }
        len += ch.to_ascii_lowercase().encode_utf8(&mut out[len..]).len();
    }
    Some(len)
}

/// Normalize into a fresh string. Same rules as [`normalize_into`].
pub fn normalize(content: &str) -> String {
    let mut buf = vec![0u8; content.len()];
    let len = normalize_into(content, &mut buf).unwrap_or(0);
    buf.truncate(len);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Fingerprint of a detection request.
pub fn content_fingerprint(content: &str, metadata: &Metadata) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize(content).as_bytes());
    hasher.update(b"\x1f");
    if !metadata.is_empty() {
        // serde_json maps are key-sorted, so this form is canonical
        hasher.update(serde_json::Value::Object(metadata.clone()).to_string().as_bytes());
    }
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Fingerprint of a similarity-search query.
pub fn similarity_fingerprint(
    embedding: &[f32],
    top_k: usize,
    score_threshold: f32,
    filters: &Metadata,
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(embedding.len() as u64).to_le_bytes());

    let stride = embedding.len().div_ceil(SIMILARITY_SAMPLE).max(1);
    for value in embedding.iter().step_by(stride).take(SIMILARITY_SAMPLE) {
        let quantized = (value * QUANTIZE_SCALE).round() as i32;
        hasher.update(&quantized.to_le_bytes());
    }

    hasher.update(&(top_k as u64).to_le_bytes());
    hasher.update(&score_threshold.to_bits().to_le_bytes());
    if !filters.is_empty() {
        hasher.update(serde_json::Value::Object(filters.clone()).to_string().as_bytes());
    }
    Fingerprint(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_case_and_space() {
        assert_eq!(normalize("  Ignore\tPrevious \n\n Instructions  "), "ignore previous instructions");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
        // Non-ASCII passes through untouched
        assert_eq!(normalize("Ünïcode\u{2003}Text"), "Ünïcode text");
    }

    #[test]
    fn test_normalize_into_requires_room() {
        let mut small = [0u8; 3];
        assert_eq!(normalize_into("abcd", &mut small), None);

        let mut buf = [0u8; 16];
        let n = normalize_into("A  B", &mut buf).unwrap();
        assert_eq!(&buf[..n], b"a b");
    }

    #[test]
    fn test_content_fingerprint_is_stable() {
        let meta = Metadata::new();
        let a = content_fingerprint("Hello   World", &meta);
        let b = content_fingerprint("hello world", &meta);
        let c = content_fingerprint("hello there", &meta);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_serializes_as_hex() {
        let fp = content_fingerprint("hello", &Metadata::new());
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
        assert!(serde_json::from_str::<Fingerprint>("\"not-hex\"").is_err());
    }

    #[test]
    fn test_metadata_changes_fingerprint() {
        let mut meta = Metadata::new();
        let plain = content_fingerprint("same", &meta);
        meta.insert("source".into(), serde_json::json!("email"));
        assert_ne!(plain, content_fingerprint("same", &meta));
    }

    #[test]
    fn test_similarity_fingerprint_parameters() {
        let v: Vec<f32> = (0..384).map(|i| (i as f32 / 384.0).sin()).collect();
        let none = Metadata::new();
        let base = similarity_fingerprint(&v, 5, 0.6, &none);
        assert_eq!(base, similarity_fingerprint(&v, 5, 0.6, &none));
        assert_ne!(base, similarity_fingerprint(&v, 6, 0.6, &none));
        assert_ne!(base, similarity_fingerprint(&v, 5, 0.7, &none));
    }

    #[test]
    fn test_similarity_fingerprint_samples_bounded() {
        // A change outside the sampled components collides by construction
        let v: Vec<f32> = vec![0.5; 640];
        let mut w = v.clone();
        w[1] = -0.5;
        let none = Metadata::new();
        assert_eq!(
            similarity_fingerprint(&v, 5, 0.6, &none),
            similarity_fingerprint(&w, 5, 0.6, &none)
        );
        w[0] = -0.5;
        assert_ne!(
            similarity_fingerprint(&v, 5, 0.6, &none),
            similarity_fingerprint(&w, 5, 0.6, &none)
        );
    }
}
