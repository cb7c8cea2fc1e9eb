//! Retry with exponential backoff around any stager

use super::{FetchError, Stage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Retrying<S> {
    inner: S,
    retries: u32,
    base_delay: Duration,
}

impl<S> Retrying<S> {
    /// Up to `retries` extra attempts, waiting 1s, 2s, 4s, ... between them
    pub fn new(inner: S, retries: u32) -> Self {
        Self {
            inner,
            retries,
            base_delay: Duration::from_secs(1),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries + 1
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[async_trait]
impl<S: Stage> Stage for Retrying<S> {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match self.inner.stage(locator).await {
                Ok(path) => return Ok(path),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(if max_attempts > 1 {
                        FetchError::RetriesExhausted {
                            attempts: max_attempts,
                            last: Box::new(e),
                        }
                    } else {
                        e
                    });
                },
                Err(e) => {
                    warn!("Staging attempt {}/{} failed: {}", attempt, max_attempts, e);
                    let delay = self.backoff(attempt);
                    info!("Retrying in {:?}...", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `status` for the first `failures` calls
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        status: u16,
    }

    impl Flaky {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                status,
            }
        }
    }

    #[async_trait]
    impl Stage for Flaky {
        async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(FetchError::Status {
                    url: locator.to_string(),
                    status: self.status,
                })
            } else {
                Ok(PathBuf::from("/tmp/staged.csv"))
            }
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let retrying = Retrying::new(Flaky::new(0, 500), 3);
        assert_eq!(retrying.max_attempts(), 4);
        assert_eq!(retrying.backoff(1), Duration::from_secs(1));
        assert_eq!(retrying.backoff(2), Duration::from_secs(2));
        assert_eq!(retrying.backoff(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retries() {
        let retrying = Retrying::new(Flaky::new(2, 503), 2);
        let path = retrying.stage("https://example.com/a.csv").await.unwrap();
        assert_eq!(path, PathBuf::from("/tmp/staged.csv"));
        assert_eq!(retrying.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_retries() {
        let retrying = Retrying::new(Flaky::new(5, 500), 2);
        let err = retrying.stage("https://example.com/a.csv").await.unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(retrying.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let retrying = Retrying::new(Flaky::new(5, 404), 2);
        let err = retrying.stage("https://example.com/a.csv").await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(retrying.inner.calls.load(Ordering::SeqCst), 1);
    }
}
