//! Job specification and content fingerprinting.
//!
//! A [`JobSpec`] is the immutable description of one pipeline job, produced
//! by the upstream planner and read-only here. Its identity is a SHA-256
//! [`Fingerprint`] over a versioned canonical JSON encoding, used as the
//! script cache key. Map-valued fields use `BTreeMap` so re-serializing a
//! semantically identical spec always yields the same digest.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version of the fingerprint scheme (digest input + canonicalization).
///
/// Bumping this invalidates every cached script: the version is mixed into
/// the digest input and recorded in cache metadata, so entries written under
/// an older scheme become ordinary cache misses rather than errors.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Immutable description of one pipeline job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub pipeline_name: String,
    pub source: SourceSpec,
    pub target: ObjectRef,
    #[serde(default)]
    pub transform: Option<TransformSpec>,
}

/// Where the job reads its input from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// External REST API, fetched by the generated script itself.
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default = "default_format")]
        format: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    /// Object already in the data lake, read through a download grant.
    Object { bucket: String, key: String },
}

/// One object in the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// Transformation intent, passed verbatim into the generation prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSpec {
    pub instruction: String,
    #[serde(default)]
    pub schema: BTreeMap<String, String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

/// SHA-256 digest of a canonical [`JobSpec`] encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Lowercase hex form, used as the cache file stem.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl JobSpec {
    /// Computes the deterministic fingerprint of this spec.
    ///
    /// Stable across process restarts: the encoding is plain serde_json of
    /// the struct (fixed field order, sorted maps) prefixed with the scheme
    /// version.
    pub fn fingerprint(&self) -> Fingerprint {
        // Serializing a JobSpec cannot fail: no maps with non-string keys,
        // no non-finite floats.
        let canonical =
            serde_json::to_string(self).expect("JobSpec serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(format!("v{FINGERPRINT_VERSION}\n"));
        hasher.update(canonical.as_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let spec: JobSpec = serde_json::from_str(&content)?;
        Ok(spec)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_spec() -> JobSpec {
        JobSpec {
            pipeline_name: "knmi-weather".to_string(),
            source: SourceSpec::Http {
                url: "https://api.example.org/v1/observations".to_string(),
                method: "GET".to_string(),
                format: "json".to_string(),
                params: BTreeMap::from([("station".to_string(), "260".to_string())]),
            },
            target: ObjectRef {
                bucket: "datalake".to_string(),
                key: "layer=landing/source=knmi/observations.json".to_string(),
            },
            transform: None,
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = sample_spec().fingerprint();
        let b = sample_spec().fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.hex(), b.hex());
    }

    #[test]
    fn test_fingerprint_hex_is_64_chars() {
        let fp = sample_spec().fingerprint();
        assert_eq!(fp.hex().len(), 64);
        assert!(fp.hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_changes_with_spec() {
        let mut other = sample_spec();
        other.pipeline_name = "knmi-weather-v2".to_string();
        assert_ne!(sample_spec().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_params() {
        let mut other = sample_spec();
        if let SourceSpec::Http { ref mut params, .. } = other.source {
            params.insert("station".to_string(), "280".to_string());
        }
        assert_ne!(sample_spec().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_spec_roundtrips_through_json() {
        let spec = sample_spec();
        let json = serde_json::to_string(&spec).unwrap();
        let back: JobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec.fingerprint(), back.fingerprint());
    }

    #[test]
    fn test_source_defaults() {
        let json = r#"{
            "pipeline_name": "p",
            "source": { "kind": "http", "url": "https://x.example" },
            "target": { "bucket": "b", "key": "k" }
        }"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        match spec.source {
            SourceSpec::Http { method, format, .. } => {
                assert_eq!(method, "GET");
                assert_eq!(format, "json");
            }
            _ => panic!("expected http source"),
        }
    }
}
