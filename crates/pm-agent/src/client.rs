//! HTTP client used by the update manager.
//!
//! `UpdateClient` is a capability trait so tests can drive the manager with
//! canned manifests and byte streams. The production implementation talks to
//! the server's manifest and artifact endpoints, resuming downloads with a
//! `Range` header when a partial file is present.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use pm_protocol::SignedManifest;

/// Bytes-progress callback: `(downloaded_total, expected_total)`.
/// Invocations may arrive out of order; consumers must tolerate that.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[async_trait]
pub trait UpdateClient: Send + Sync {
    /// Fetch the latest signed manifest for this agent's identity.
    async fn latest_manifest(
        &self,
        component: &str,
        platform: &str,
        arch: &str,
        channel: &str,
    ) -> anyhow::Result<SignedManifest>;

    /// Download `url` into `dest`, appending from `resume_from` when
    /// non-zero. Returns the number of bytes written by this attempt.
    /// Honors the cancellation latch between chunks.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        resume_from: u64,
        expected_total: u64,
        progress: Option<ProgressFn>,
        cancelled: &AtomicBool,
    ) -> anyhow::Result<u64>;
}

pub struct HttpUpdateClient {
    client: reqwest::Client,
    /// HTTP base URL of the server (no trailing slash).
    base_url: String,
}

impl HttpUpdateClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("printmaster-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Derive the HTTP base from a control-channel URL
    /// (e.g. `wss://host/ws/agent` → `https://host`).
    pub fn base_from_ws_url(ws_url: &str) -> String {
        ws_url
            .replace("wss://", "https://")
            .replace("ws://", "http://")
            .split("/ws/")
            .next()
            .unwrap_or("http://localhost:8080")
            .trim_end_matches('/')
            .to_string()
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl UpdateClient for HttpUpdateClient {
    async fn latest_manifest(
        &self,
        component: &str,
        platform: &str,
        arch: &str,
        channel: &str,
    ) -> anyhow::Result<SignedManifest> {
        let url = format!(
            "{}/api/manifests/latest?component={}&platform={}&arch={}&channel={}",
            self.base_url, component, platform, arch, channel
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("manifest query returned HTTP {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        resume_from: u64,
        expected_total: u64,
        progress: Option<ProgressFn>,
        cancelled: &AtomicBool,
    ) -> anyhow::Result<u64> {
        let mut request = self.client.get(self.absolute(url));
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("download returned HTTP {status}");
        }

        // A server that ignores the Range request sends the whole body;
        // start the file over in that case.
        let resuming = resume_from > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut file = if resuming {
            tokio::fs::OpenOptions::new().append(true).open(dest).await?
        } else {
            tokio::fs::File::create(dest).await?
        };

        let mut written: u64 = 0;
        let mut total = if resuming { resume_from } else { 0 };
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancelled.load(Ordering::SeqCst) {
                anyhow::bail!("download cancelled");
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            total += chunk.len() as u64;
            if let Some(cb) = &progress {
                let cb = cb.clone();
                let expected = expected_total.max(total);
                // Callbacks run off the download path.
                tokio::spawn(async move { cb(total, expected) });
            }
        }
        file.flush().await?;

        Ok(written)
    }
}
