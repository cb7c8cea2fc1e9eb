//! Staging: turning a dataset locator into a local file
//!
//! Retry and caching wrap the stager, never the batch loop, so a retried
//! download starts from scratch and a cached file is reread from the start.

pub mod cache;
pub mod http;
pub mod progress;
pub mod retry;

use crate::config::IngestConfig;
use crate::storage::Storage;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use taxi_common::EtlError;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub use self::cache::Cached;
pub use self::http::HttpStager;
pub use self::retry::Retrying;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid locator '{0}'")]
    InvalidLocator(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] EtlError),

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Io(_) | FetchError::Storage(_) => true,
            FetchError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Something that can make a dataset available on local disk
#[async_trait]
pub trait Stage: Send + Sync {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError>;
}

#[async_trait]
impl<S: Stage + ?Sized> Stage for Box<S> {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        (**self).stage(locator).await
    }
}

/// Where a dataset lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Http(String),
    File(PathBuf),
    Bucket { bucket: Option<String>, key: String },
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(FetchError::InvalidLocator(raw.to_string()));
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(Locator::Http(raw.to_string()))
        } else if let Some(rest) = raw.strip_prefix("s3://") {
            match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                    Ok(Locator::Bucket {
                        bucket: Some(bucket.to_string()),
                        key: key.to_string(),
                    })
                },
                _ => Err(FetchError::InvalidLocator(raw.to_string())),
            }
        } else if let Some(path) = raw.strip_prefix("file://") {
            Ok(Locator::File(PathBuf::from(path)))
        } else if raw.contains("://") {
            Err(FetchError::InvalidLocator(raw.to_string()))
        } else {
            Ok(Locator::File(PathBuf::from(raw)))
        }
    }
}

/// Stages files that are already local
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStager;

#[async_trait]
impl Stage for LocalStager {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        let path = match Locator::parse(locator)? {
            Locator::File(path) => path,
            _ => return Err(FetchError::InvalidLocator(locator.to_string())),
        };

        if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            debug!("Using local file {}", path.display());
            Ok(path)
        } else {
            Err(FetchError::NotFound(path))
        }
    }
}

/// Downloads objects from the configured bucket to `{staging_dir}/{key}`
#[derive(Debug, Clone)]
pub struct BucketStager {
    storage: Storage,
    staging_dir: PathBuf,
}

impl BucketStager {
    pub fn new(storage: Storage, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            staging_dir: staging_dir.into(),
        }
    }

    fn key_for(&self, locator: &str) -> Result<String, FetchError> {
        match Locator::parse(locator)? {
            Locator::Bucket { bucket: Some(bucket), key } if bucket == self.storage.bucket() => {
                Ok(key)
            },
            Locator::Bucket { .. } | Locator::Http(_) => {
                Err(FetchError::InvalidLocator(locator.to_string()))
            },
            // bare keys name objects in our bucket
            Locator::File(_) => Ok(locator.trim_start_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl Stage for BucketStager {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        let key = self.key_for(locator)?;
        let path = self.staging_dir.join(&key);

        info!("Downloading {} to {}", self.storage.object_url(&key), path.display());
        self.storage
            .download_to_file(&key, &path)
            .await
            .map_err(FetchError::Storage)?;

        Ok(path)
    }
}

/// Build the stager for a locator: cached, retried, then the scheme's stager
pub fn stager_for(
    locator: &str,
    config: &IngestConfig,
    storage: Option<&Storage>,
) -> Result<Cached<Retrying<Box<dyn Stage>>>, FetchError> {
    let staging_dir = config.staging_dir();
    let inner: Box<dyn Stage> = match Locator::parse(locator)? {
        Locator::Http(_) => Box::new(HttpStager::new(&staging_dir)?),
        Locator::File(_) => Box::new(LocalStager),
        Locator::Bucket { .. } => match storage {
            Some(storage) => Box::new(BucketStager::new(storage.clone(), &staging_dir)),
            None => return Err(FetchError::InvalidLocator(locator.to_string())),
        },
    };

    Ok(Cached::new(
        Retrying::new(inner, config.stage_retries),
        staging_dir.join(".cache"),
        config.cache_ttl(),
    ))
}

/// Write a temporary file and move it into place once complete
pub(crate) async fn write_atomically<F, Fut>(path: &Path, write: F) -> Result<u64, FetchError>
where
    F: FnOnce(tokio::fs::File) -> Fut,
    Fut: std::future::Future<Output = Result<(tokio::fs::File, u64), FetchError>>,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let file = tokio::fs::File::create(&partial).await?;
    match write(file).await {
        Ok((mut file, written)) => {
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&partial, path).await?;
            Ok(written)
        },
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parsing() {
        assert_eq!(
            Locator::parse("https://example.com/yellow.csv.gz").unwrap(),
            Locator::Http("https://example.com/yellow.csv.gz".to_string())
        );
        assert_eq!(
            Locator::parse("s3://trips/data/yellow/a.parquet").unwrap(),
            Locator::Bucket {
                bucket: Some("trips".to_string()),
                key: "data/yellow/a.parquet".to_string()
            }
        );
        assert_eq!(
            Locator::parse("file:///tmp/a.csv").unwrap(),
            Locator::File(PathBuf::from("/tmp/a.csv"))
        );
        assert_eq!(
            Locator::parse("./data/output.csv").unwrap(),
            Locator::File(PathBuf::from("./data/output.csv"))
        );
        assert!(Locator::parse("ftp://example.com/a.csv").is_err());
        assert!(Locator::parse("s3://bucket-only").is_err());
        assert!(Locator::parse("  ").is_err());
    }

    #[test]
    fn test_retryable_errors() {
        let server_error = FetchError::Status {
            url: "u".into(),
            status: 503,
        };
        let not_found = FetchError::Status {
            url: "u".into(),
            status: 404,
        };
        assert!(server_error.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!FetchError::NotFound(PathBuf::from("x")).is_retryable());
    }

    #[tokio::test]
    async fn test_local_stager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.csv");
        std::fs::write(&path, "a\n1\n").unwrap();

        let staged = LocalStager.stage(path.to_str().unwrap()).await.unwrap();
        assert_eq!(staged, path);

        let url = format!("file://{}", path.display());
        assert_eq!(LocalStager.stage(&url).await.unwrap(), path);

        let missing = dir.path().join("missing.csv");
        let err = LocalStager.stage(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(p) if p == missing));
    }

    #[tokio::test]
    async fn test_bucket_keys() {
        let storage = Storage::new(crate::storage::StorageConfig::for_minio(
            "http://localhost:9000",
            "trips",
        ))
        .await
        .unwrap();
        let stager = BucketStager::new(storage, "/tmp/staging");

        assert_eq!(
            stager.key_for("s3://trips/data/green/a.parquet").unwrap(),
            "data/green/a.parquet"
        );
        assert_eq!(stager.key_for("data/green/a.parquet").unwrap(), "data/green/a.parquet");
        assert!(stager.key_for("s3://other/data/green/a.parquet").is_err());
    }
}
