//! HTTP(S) downloads with a progress bar

use super::progress::{create_download_progress, format_bytes};
use super::{write_atomically, FetchError, Stage};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Streams a URL to `{staging_dir}/{file name}`
///
/// The file name is the last path segment of the URL, so `.csv.gz` and
/// `.parquet` extensions survive and format detection keeps working.
#[derive(Debug, Clone)]
pub struct HttpStager {
    client: Client,
    staging_dir: PathBuf,
}

impl HttpStager {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("taxi-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, staging_dir))
    }

    pub fn with_client(client: Client, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            staging_dir: staging_dir.into(),
        }
    }

    /// Local path a URL is downloaded to
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.staging_dir.join(file_name_from_url(url))
    }
}

/// Last path segment of a URL, without query or fragment
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let without_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);

    match without_scheme.split_once('/') {
        Some((_, path)) => path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("download")
            .to_string(),
        None => "download".to_string(),
    }
}

#[async_trait]
impl Stage for HttpStager {
    async fn stage(&self, locator: &str) -> Result<PathBuf, FetchError> {
        let path = self.path_for(locator);
        info!("Downloading {} to {}", locator, path.display());

        let response = self.client.get(locator).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: locator.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let file_name = file_name_from_url(locator);
        let pb = create_download_progress(total_size, &format!("Downloading {}", file_name));

        let written = write_atomically(&path, |mut file| async move {
            let mut downloaded = 0u64;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                downloaded += chunk.len() as u64;
                pb.set_position(downloaded);
            }
            pb.finish_with_message(format!("Downloaded {}", file_name));
            Ok::<_, FetchError>((file, downloaded))
        })
        .await?;

        info!("Downloaded {} to {}", format_bytes(written), path.display());
        Ok(path)
    }
}
