//! Content-addressed cache of validated scripts.
//!
//! Two artifacts per fingerprint, addressed by its hex digest:
//! `{hex}.py` (the code body) and `{hex}.meta.json` (creation and expiry
//! metadata). Writes go to a temporary name and are atomically renamed,
//! code before metadata, so a concurrent reader never observes a partial
//! entry. Expiry is lazy: an expired or unreadable entry is evicted at
//! lookup time and reported as a miss.
//!
//! Entries are only ever created from code that has passed validation;
//! the gateway enforces that ordering.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::manifest::{Fingerprint, FINGERPRINT_VERSION};

/// A cached, previously validated script.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    fingerprint: String,
    fingerprint_version: u32,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

pub struct ScriptCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ScriptCache {
    pub fn open(dir: impl Into<PathBuf>, ttl_secs: i64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating cache dir {}", dir.display()))?;
        info!(
            "Script cache ready: dir={}, ttl={}s",
            dir.display(),
            ttl_secs
        );
        Ok(Self {
            dir,
            ttl: Duration::seconds(ttl_secs),
        })
    }

    fn code_path(&self, hex: &str) -> PathBuf {
        self.dir.join(format!("{hex}.py"))
    }

    fn meta_path(&self, hex: &str) -> PathBuf {
        self.dir.join(format!("{hex}.meta.json"))
    }

    /// Looks up a fingerprint. Expired, partial or foreign-version entries
    /// are evicted and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.get_at(fingerprint, Utc::now())
    }

    fn get_at(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<CacheEntry> {
        let hex = fingerprint.hex();
        let meta_path = self.meta_path(&hex);
        let code_path = self.code_path(&hex);

        if !meta_path.exists() || !code_path.exists() {
            debug!("Cache miss: {hex}");
            return None;
        }

        let meta: Metadata = match fs::read_to_string(&meta_path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
        {
            Ok(meta) => meta,
            Err(e) => {
                // Corrupt entry: evict, treat as a miss, let the job
                // proceed through normal generation.
                warn!("Cache entry {hex} unreadable ({e}), evicting");
                self.evict(&hex);
                return None;
            }
        };

        if meta.fingerprint_version != FINGERPRINT_VERSION {
            info!(
                "Cache entry {hex} written under fingerprint scheme v{}, evicting",
                meta.fingerprint_version
            );
            self.evict(&hex);
            return None;
        }

        if meta.expires_at <= now {
            info!("Cache expired: {hex} (created {})", meta.created_at);
            self.evict(&hex);
            return None;
        }

        let code = match fs::read_to_string(&code_path) {
            Ok(code) => code,
            Err(e) => {
                warn!("Cache entry {hex} code unreadable ({e}), evicting");
                self.evict(&hex);
                return None;
            }
        };

        info!("Cache hit: {hex}");
        Some(CacheEntry {
            fingerprint: meta.fingerprint,
            code,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
        })
    }

    /// Stores validated code under a fingerprint. Idempotent: a second put
    /// for the same fingerprint replaces the entry (last writer wins).
    pub fn put(&self, fingerprint: &Fingerprint, code: &str) -> Result<CacheEntry> {
        self.put_at(fingerprint, code, Utc::now())
    }

    fn put_at(
        &self,
        fingerprint: &Fingerprint,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let hex = fingerprint.hex();
        let created_at = now;
        let expires_at = now + self.ttl;
        let meta = Metadata {
            fingerprint: hex.clone(),
            fingerprint_version: FINGERPRINT_VERSION,
            created_at,
            expires_at,
        };

        // Write-then-publish: temp name, then atomic rename. Code first so
        // the metadata file is the publish marker.
        self.write_atomic(&self.code_path(&hex), code.as_bytes())?;
        self.write_atomic(
            &self.meta_path(&hex),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
        )?;

        info!("Cache stored: {hex} (expires {})", expires_at.to_rfc3339());
        Ok(CacheEntry {
            fingerprint: hex,
            code: code.to_string(),
            created_at,
            expires_at,
        })
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, contents)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("publishing {}", path.display()))?;
        Ok(())
    }

    fn evict(&self, hex: &str) {
        let _ = fs::remove_file(self.code_path(hex));
        let _ = fs::remove_file(self.meta_path(hex));
    }

    /// Removes every entry. Returns the number of entries removed.
    pub fn clear(&self) -> Result<usize> {
        let mut files = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                files += 1;
            }
        }
        info!("Cache cleared: {files} files removed");
        // Each entry is a code file plus a metadata file
        Ok(files / 2)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0;
        let mut total_bytes = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "py") {
                entries += 1;
                total_bytes += entry.metadata()?.len();
            }
        }
        Ok(CacheStats {
            entries,
            total_bytes,
        })
    }
}
