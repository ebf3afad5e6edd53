//! Upstream release feed abstraction.
//!
//! The intake worker is generic over [`ReleaseSource`] so tests can swap in
//! a canned feed; the production implementation polls the GitHub releases
//! API and streams asset downloads to disk with an incremental SHA-256.

use std::path::Path;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

/// One upstream release with its downloadable assets.
#[derive(Debug, Clone)]
pub struct UpstreamRelease {
    pub tag: String,
    pub draft: bool,
    pub prerelease: bool,
    pub published_at: DateTime<Utc>,
    pub notes: String,
    pub assets: Vec<UpstreamAsset>,
}

#[derive(Debug, Clone)]
pub struct UpstreamAsset {
    pub name: String,
    pub download_url: String,
    pub size: i64,
}

/// Where releases come from. `download` writes the asset to `dest` and
/// returns `(sha256_hex, size_bytes)`.
pub trait ReleaseSource: Send + Sync {
    fn recent_releases(
        &self,
        count: u32,
    ) -> impl std::future::Future<Output = anyhow::Result<Vec<UpstreamRelease>>> + Send;

    fn download(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl std::future::Future<Output = anyhow::Result<(String, i64)>> + Send;
}

// ─── GitHub implementation ───────────────────────────────────

#[derive(Debug, Deserialize)]
struct GhRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    assets: Vec<GhAsset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: i64,
}

pub struct GithubReleaseSource {
    client: reqwest::Client,
    repo: String,
}

impl GithubReleaseSource {
    pub fn new(repo: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("printmaster-server/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            repo: repo.to_string(),
        })
    }
}

impl ReleaseSource for GithubReleaseSource {
    async fn recent_releases(&self, count: u32) -> anyhow::Result<Vec<UpstreamRelease>> {
        let url = format!(
            "https://api.github.com/repos/{}/releases?per_page={}",
            self.repo,
            count.clamp(1, 100)
        );
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("release feed returned HTTP {}", resp.status());
        }

        let releases: Vec<GhRelease> = resp.json().await?;
        Ok(releases
            .into_iter()
            .map(|r| UpstreamRelease {
                tag: r.tag_name,
                draft: r.draft,
                prerelease: r.prerelease,
                published_at: r.published_at.unwrap_or_else(Utc::now),
                notes: r.body,
                assets: r
                    .assets
                    .into_iter()
                    .map(|a| UpstreamAsset {
                        name: a.name,
                        download_url: a.browser_download_url,
                        size: a.size,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<(String, i64)> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("download returned HTTP {}", resp.status());
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as i64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok((hex::encode(hasher.finalize()), size))
    }
}
