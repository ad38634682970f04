//! Credential broker — scoped, time-limited access grants.
//!
//! Converts the long-lived storage keys (which only the broker's config ever
//! holds) into pre-signed URLs scoped to exactly one object and one
//! operation direction. SigV4 query presigning (RFC-style canonical request,
//! HMAC-SHA256 chain) is implemented by hand; the signature covers the HTTP
//! method and the exact object path, so a download grant cannot write and a
//! grant for one object cannot touch another.
//!
//! Expiry is computed at issuance and enforced by the backend; the broker
//! does no revocation polling.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// Direction of an access grant. Upload signs a PUT, Download a GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    fn http_method(self) -> &'static str {
        match self {
            Operation::Upload => "PUT",
            Operation::Download => "GET",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Upload => f.write_str("upload"),
            Operation::Download => f.write_str("download"),
        }
    }
}

/// One issued grant. Owned by the execution it was issued for, discarded
/// after use or expiry. Never carries the long-lived keys.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub operation: Operation,
    pub bucket: String,
    pub object_key: String,
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("grant ttl must be positive")]
    InvalidTtl,
    #[error("invalid grant target: {0}")]
    InvalidTarget(String),
    #[error("invalid storage endpoint: {0}")]
    Endpoint(String),
}

/// Audit record of one issuance. Kept in-process, also logged.
#[derive(Debug, Clone)]
pub struct IssuanceRecord {
    pub operation: Operation,
    pub bucket: String,
    pub object_key: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct CredentialBroker {
    config: StorageConfig,
    audit: Mutex<Vec<IssuanceRecord>>,
}

impl CredentialBroker {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            audit: Mutex::new(Vec::new()),
        }
    }

    /// Issues a pre-signed URL for one operation on one object.
    ///
    /// `ttl_secs` must be positive; values above the configured maximum are
    /// clamped (logged, not rejected).
    pub fn issue(
        &self,
        operation: Operation,
        bucket: &str,
        object_key: &str,
        ttl_secs: u64,
    ) -> Result<AccessGrant, BrokerError> {
        self.issue_at(operation, bucket, object_key, ttl_secs, Utc::now())
    }

    /// Same as [`issue`](Self::issue) with an explicit issuance instant,
    /// so signing stays deterministic under test.
    pub fn issue_at(
        &self,
        operation: Operation,
        bucket: &str,
        object_key: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, BrokerError> {
        if ttl_secs == 0 {
            return Err(BrokerError::InvalidTtl);
        }
        if bucket.is_empty() {
            return Err(BrokerError::InvalidTarget("empty bucket".to_string()));
        }
        if object_key.is_empty() || object_key.starts_with('/') {
            return Err(BrokerError::InvalidTarget(format!(
                "bad object key '{object_key}'"
            )));
        }

        let max_ttl = self.config.max_grant_ttl_secs;
        let ttl_secs = if ttl_secs > max_ttl {
            warn!("Requested grant ttl {ttl_secs}s exceeds maximum, clamping to {max_ttl}s");
            max_ttl
        } else {
            ttl_secs
        };

        let url = self.presign(operation, bucket, object_key, ttl_secs, now)?;
        let expires_at = now + Duration::seconds(ttl_secs as i64);

        let record = IssuanceRecord {
            operation,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            issued_at: now,
            expires_at,
        };
        info!(
            "Issued {} grant: bucket={bucket}, key={object_key}, expires_at={}",
            operation,
            expires_at.to_rfc3339()
        );
        self.audit
            .lock()
            .expect("audit mutex poisoned")
            .push(record);

        Ok(AccessGrant {
            operation,
            bucket: bucket.to_string(),
            object_key: object_key.to_string(),
            url,
            issued_at: now,
            expires_at,
        })
    }

    /// Copy of the audit trail.
    pub fn audit_log(&self) -> Vec<IssuanceRecord> {
        self.audit.lock().expect("audit mutex poisoned").clone()
    }

    // ── SigV4 query presigning ─────────────────────────────────────

    fn presign(
        &self,
        operation: Operation,
        bucket: &str,
        object_key: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<String, BrokerError> {
        let endpoint = Url::parse(&self.config.endpoint_url)
            .map_err(|e| BrokerError::Endpoint(e.to_string()))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(BrokerError::Endpoint(format!(
                    "no host in '{}'",
                    self.config.endpoint_url
                )))
            }
        };

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let region = &self.config.region;
        let scope = format!("{date}/{region}/s3/aws4_request");
        let credential = format!("{}/{scope}", self.config.access_key);

        // Path-style addressing: /<bucket>/<key>, slashes in the key kept
        let canonical_uri = format!(
            "/{}/{}",
            uri_encode(bucket, false),
            uri_encode(object_key, true)
        );

        // Query parameters, already in byte order
        let canonical_query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256\
             &X-Amz-Credential={}\
             &X-Amz-Date={amz_date}\
             &X-Amz-Expires={ttl_secs}\
             &X-Amz-SignedHeaders=host",
            uri_encode(&credential, false)
        );

        let canonical_request = format!(
            "{}\n{canonical_uri}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD",
            operation.http_method()
        );

        let hashed_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign =
            format!("AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{hashed_request}");

        // kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), "s3"), "aws4_request")
        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_key).as_bytes(),
            date.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let base = self.config.endpoint_url.trim_end_matches('/');
        Ok(format!(
            "{base}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}"
        ))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// AWS-style percent encoding: unreserved characters pass through, `/` only
/// inside object paths, everything else becomes uppercase %XX.
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
