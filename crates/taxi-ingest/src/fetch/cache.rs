//! Time-limited cache of staged files
//!
//! Entries are keyed by the SHA-256 of the locator and stored as small JSON
//! files next to the staged data. A hit requires the entry to be younger than
//! the TTL and the staged file to still match its recorded checksum.

use super::{FetchError, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taxi_common::checksum::{compute_file_checksum, sha256_hex, verify_file_checksum, ChecksumAlgorithm};
use taxi_common::EtlError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub locator: String,
    pub path: PathBuf,
    pub checksum: String,
    pub staged_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Cached<S> {
    inner: S,
    cache_dir: PathBuf,
    ttl: Duration,
}

impl<S> Cached<S> {
    pub fn new(inner: S, cache_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            inner,
            cache_dir: cache_dir.into(),
            ttl,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn entry_path(&self, locator: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", sha256_hex(locator)))
    }

    fn read_entry(&self, locator: &str) -> Option<CacheEntry> {
        let raw = std::fs::read(self.entry_path(locator)).ok()?;
        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) if entry.locator == locator => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring unreadable cache entry for {}: {}", locator, e);
                None
            },
        }
    }

    fn write_entry(&self, locator: &str, path: &Path) -> Result<CacheEntry, EtlError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let entry = CacheEntry {
            locator: locator.to_string(),
            path: path.to_path_buf(),
            checksum: compute_file_checksum(path, ChecksumAlgorithm::Sha256)?,
            staged_at: Utc::now(),
        };
        std::fs::write(self.entry_path(locator), serde_json::to_vec_pretty(&entry)?)?;
        Ok(entry)
    }

    /// Cached path for `locator`, if still fresh and intact
    pub fn lookup(&self, locator: &str) -> Option<PathBuf> {
        let entry = self.read_entry(locator)?;

        let age = Utc::now()
            .signed_duration_since(entry.staged_at)
            .to_std()
            .unwrap_or_default();
        if age >= self.ttl {
            debug!("Cache entry for {} expired ({:?} old)", locator, age);
            return None;
        }

        match verify_file_checksum(&entry.path, &entry.checksum, ChecksumAlgorithm::Sha256) {
            Ok(()) => Some(entry.path),
            Err(EtlError::ChecksumMismatch { .. }) => {
                warn!("Cached file {} changed on disk; staging again", entry.path.display());
                None
            },
            Err(e) => {
                debug!("Cached file {} unavailable: {}", entry.path.display(), e);
                None
            },
        }
    }
}

#[async_trait]
impl<S: Stage> Stage for Cached<S> {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        if let Some(path) = self.lookup(locator) {
            info!("Using cached copy of {} at {}", locator, path.display());
            return Ok(path);
        }

        let path = self.inner.stage(locator).await?;
        let entry = self.write_entry(locator, &path)?;
        debug!("Cached {} as {} ({})", locator, entry.path.display(), entry.checksum);

        Ok(path)
    }
}
