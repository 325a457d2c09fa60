// Network client
//
// HTTP access for the package source: text GETs with retries for registry
// metadata, and streamed downloads for package archives.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

const RETRY_DELAY_MS: u64 = 1000;
const USER_AGENT: &str = concat!("extension-host/", env!("CARGO_PKG_VERSION"));

/// Network operations the package source depends on.
#[async_trait]
pub trait NetworkTool: Send + Sync {
    /// GET `url` and return the body. `retries` extra attempts are made on
    /// rate limiting, server errors and transport failures.
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        retries: u32,
        timeout: Duration,
    ) -> Result<String>;

    /// Stream `url` into the file at `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// reqwest-backed implementation
pub struct HttpNetworkTool {
    client: reqwest::Client,
}

impl HttpNetworkTool {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkTool for HttpNetworkTool {
    async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        retries: u32,
        timeout: Duration,
    ) -> Result<String> {
        let attempts = retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            log::debug!("Registry request: {} (attempt {})", url, attempt + 1);

            let mut request = self.client.get(url).timeout(timeout);
            for (key, value) in headers {
                request = request.header(key.as_str(), value.as_str());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .text()
                            .await
                            .map_err(|e| anyhow!("Failed to read response body: {}", e));
                    }

                    let body = response.text().await.unwrap_or_default();
                    last_error = format!("HTTP {}: {}", status.as_u16(), body);
                    if status.as_u16() == 429 {
                        let delay = RETRY_DELAY_MS * (attempt as u64 + 1);
                        log::warn!("Registry rate limited, waiting {}ms before retry", delay);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        continue;
                    }
                    if status.is_server_error() {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                        continue;
                    }
                    // 404 and other client errors will not improve on retry.
                    return Err(anyhow!(last_error));
                }
                Err(e) => {
                    last_error = format!("Request failed: {}", e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                }
            }
        }

        Err(anyhow!(
            "Request failed after {} attempts: {}",
            attempts,
            last_error
        ))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {} while downloading {}", status.as_u16(), url));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Failed to read download stream")?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
        }
        file.flush().await?;

        log::debug!("Downloaded {} bytes from {}", downloaded, url);
        Ok(())
    }
}
