//! In-process HTTP backend

use super::{discard, prepare, publish, timed_out, write_failed, Fetcher, Progress, Throttled};
use crate::error::{FetchErrorKind, FetchFailure};
use crate::storage::StorageDir;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Streams the response body with `reqwest`
pub struct HttpFetcher {
    client: reqwest::Client,
    storage: StorageDir,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, storage: StorageDir) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client, storage })
    }

    async fn transfer(
        &self,
        source_url: &str,
        partial: &Path,
        progress: &dyn Progress,
    ) -> Result<(), FetchFailure> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await
            .map_err(request_failure)?;

        if !response.status().is_success() {
            return Err(FetchFailure::new(
                FetchErrorKind::ProcessError,
                format!("server responded with {}", response.status()),
            ));
        }

        let total = response.content_length();
        progress.report(0, total);

        let mut file = File::create(partial)
            .await
            .map_err(|e| write_failed("failed to create output", e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut throttled = Throttled::new(progress);

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(request_failure)?;
            file.write_all(&bytes)
                .await
                .map_err(|e| write_failed("failed to write output", e))?;

            downloaded += bytes.len() as u64;
            throttled.report(downloaded, total);
        }

        file.flush()
            .await
            .map_err(|e| write_failed("failed to flush output", e))?;

        Ok(())
    }
}

fn request_failure(e: reqwest::Error) -> FetchFailure {
    let kind = if e.is_builder() {
        FetchErrorKind::InvalidUrl
    } else if e.is_timeout() {
        FetchErrorKind::Timeout
    } else if e.is_connect() {
        FetchErrorKind::ConnectFailed
    } else {
        FetchErrorKind::ProcessError
    };
    FetchFailure::new(kind, format!("request failed: {}", e))
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        source_url: &str,
        destination: &Path,
        timeout: Duration,
        progress: &dyn Progress,
    ) -> Result<u64, FetchFailure> {
        let partial = prepare(&self.storage, destination).await?;

        let transfer = self.transfer(source_url, &partial, progress);
        let result = match tokio::time::timeout(timeout, transfer).await {
            Ok(Ok(())) => publish(&partial, destination).await,
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(timed_out(timeout)),
        };

        if result.is_err() {
            discard(&partial).await;
        }
        result
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
