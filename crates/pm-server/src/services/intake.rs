//! Release intake — one polling pass over the upstream feed.
//!
//! Each pass discovers new artifacts, downloads them into the local cache
//! while hashing, signs a manifest for every complete artifact, and prunes
//! versions past the retention horizon. One bad release never aborts a pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use pm_common::version;

use crate::services::release_source::{ReleaseSource, UpstreamRelease};
use crate::services::signer::ManifestSigner;
use crate::store::artifacts::ArtifactKey;
use crate::store::{ArtifactStore, ManifestStore, ReleaseArtifact};

/// Components the intake recognizes in release tags.
const KNOWN_COMPONENTS: &[&str] = &["agent", "server"];

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub cache_dir: PathBuf,
    /// Newest versions kept per component; 0 disables pruning.
    pub max_releases: u32,
    pub channel: String,
}

/// Counters for one pass, logged at the end.
#[derive(Debug, Default, PartialEq)]
pub struct PassStats {
    pub discovered: usize,
    pub downloaded: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub pruned_versions: usize,
}

pub struct ReleaseIntake<S: ReleaseSource> {
    source: S,
    artifacts: ArtifactStore,
    manifests: ManifestStore,
    signer: Arc<ManifestSigner>,
    cfg: IntakeConfig,
}

impl<S: ReleaseSource> ReleaseIntake<S> {
    pub fn new(
        source: S,
        artifacts: ArtifactStore,
        manifests: ManifestStore,
        signer: Arc<ManifestSigner>,
        cfg: IntakeConfig,
    ) -> Self {
        Self {
            source,
            artifacts,
            manifests,
            signer,
            cfg,
        }
    }

    /// Run one full pass: fetch, ingest, prune.
    pub async fn run_pass(&self) -> anyhow::Result<PassStats> {
        let fetch_count = (self.cfg.max_releases * 3).max(10);
        let releases = self.source.recent_releases(fetch_count).await?;
        let mut stats = PassStats::default();

        for release in &releases {
            if let Err(e) = self.ingest_release(release, &mut stats).await {
                tracing::warn!(tag = %release.tag, "Release ingest failed, skipping: {e}");
                stats.skipped += 1;
            }
        }

        if self.cfg.max_releases > 0 {
            stats.pruned_versions = self.prune(self.cfg.max_releases as usize).await?;
        }

        tracing::info!(
            discovered = stats.discovered,
            downloaded = stats.downloaded,
            refreshed = stats.refreshed,
            skipped = stats.skipped,
            pruned = stats.pruned_versions,
            "Release intake pass complete"
        );
        Ok(stats)
    }

    async fn ingest_release(
        &self,
        release: &UpstreamRelease,
        stats: &mut PassStats,
    ) -> anyhow::Result<()> {
        if release.draft || release.prerelease {
            return Ok(());
        }
        let Some((component, tag_version)) = parse_release_tag(&release.tag) else {
            return Ok(());
        };
        if !KNOWN_COMPONENTS.contains(&component) {
            return Ok(());
        }

        for asset in &release.assets {
            let Some(parts) = parse_asset_name(&asset.name) else {
                continue;
            };
            if parts.component != component || parts.version != tag_version {
                tracing::debug!(asset = %asset.name, tag = %release.tag, "Asset does not match its release tag");
                continue;
            }

            stats.discovered += 1;

            let key = ArtifactKey {
                component: parts.component.to_string(),
                version: parts.version.to_string(),
                platform: parts.platform.to_string(),
                arch: parts.arch.to_string(),
            };

            let existing = self.artifacts.find(&key).await?;
            let cached_ok = match &existing {
                Some(a) => {
                    !a.sha256.is_empty()
                        && !a.cache_path.is_empty()
                        && tokio::fs::try_exists(&a.cache_path).await.unwrap_or(false)
                }
                None => false,
            };

            if cached_ok {
                // Only mutable metadata moves for a known, cached artifact.
                self.artifacts
                    .update_metadata(
                        &key,
                        &asset.download_url,
                        asset.size,
                        release.published_at,
                        &release.notes,
                    )
                    .await?;
                let refreshed = self.artifacts.get(&key).await?;
                self.signer.ensure_manifest_for_artifact(&refreshed).await?;
                stats.refreshed += 1;
                continue;
            }

            match self.download_artifact(&key, asset, release).await {
                Ok(artifact) => {
                    self.signer.ensure_manifest_for_artifact(&artifact).await?;
                    stats.downloaded += 1;
                }
                Err(e) => {
                    tracing::warn!(asset = %asset.name, "Artifact download failed, skipping: {e}");
                    stats.skipped += 1;
                }
            }
        }

        Ok(())
    }

    async fn download_artifact(
        &self,
        key: &ArtifactKey,
        asset: &crate::services::release_source::UpstreamAsset,
        release: &UpstreamRelease,
    ) -> anyhow::Result<ReleaseArtifact> {
        let dir = self
            .cfg
            .cache_dir
            .join(&key.component)
            .join(&key.version);
        tokio::fs::create_dir_all(&dir).await?;

        let final_path = dir.join(&asset.name);
        let temp_path = dir.join(format!("{}.tmp", asset.name));

        let (sha256, size) = self.source.download(&asset.download_url, &temp_path).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;

        let mut artifact = ReleaseArtifact::new(
            key.clone(),
            &self.cfg.channel,
            &asset.download_url,
            release.published_at,
        );
        artifact.cache_path = final_path.to_string_lossy().into_owned();
        artifact.sha256 = sha256;
        artifact.size_bytes = size;
        artifact.downloaded_at = Some(Utc::now());
        artifact.release_notes = release.notes.clone();

        self.artifacts.upsert(&artifact).await?;
        tracing::info!(
            component = %key.component,
            version = %key.version,
            platform = %key.platform,
            arch = %key.arch,
            size,
            "Artifact cached"
        );
        Ok(artifact)
    }

    /// Keep the newest `keep` versions per component; delete rows and cache
    /// files for the rest. File removal is best-effort.
    async fn prune(&self, keep: usize) -> anyhow::Result<usize> {
        let mut pruned = 0usize;

        for component in self.artifacts.components().await? {
            let mut versions = self.artifacts.versions(&component).await?;
            versions.sort_by(|a, b| version::compare(b, a));

            for stale in versions.iter().skip(keep) {
                for artifact in self.artifacts.for_version(&component, stale).await? {
                    if !artifact.cache_path.is_empty() {
                        if let Err(e) = tokio::fs::remove_file(&artifact.cache_path).await {
                            tracing::debug!(path = %artifact.cache_path, "Cache file removal failed: {e}");
                        }
                    }
                }
                self.artifacts.delete_version(&component, stale).await?;
                self.manifests.delete_version(&component, stale).await?;
                pruned += 1;
                tracing::info!(%component, version = %stale, "Pruned release past retention");
            }
        }

        Ok(pruned)
    }
}

// ─── Name parsing ────────────────────────────────────────────

/// `<component>-v<version>` → `(component, version)`.
pub fn parse_release_tag(tag: &str) -> Option<(&str, &str)> {
    let (component, version) = tag.rsplit_once("-v")?;
    if component.is_empty() || version.is_empty() {
        return None;
    }
    if !is_safe_segment(component) || !is_safe_segment(version) {
        return None;
    }
    Some((component, version))
}

#[derive(Debug, PartialEq)]
pub struct AssetParts<'a> {
    pub component: &'a str,
    pub version: &'a str,
    pub platform: &'a str,
    pub arch: &'a str,
    /// `exe`, `msi`, or empty.
    pub ext: &'a str,
}

/// `printmaster-<component>-v<version>-<platform>-<arch>[.<ext>]`.
///
/// Every segment must pass the safe-segment check; anything else is treated
/// as a foreign asset and ignored.
pub fn parse_asset_name(name: &str) -> Option<AssetParts<'_>> {
    let rest = name.strip_prefix("printmaster-")?;
    let (component, rest) = rest.split_once("-v")?;

    let (rest, ext) = match rest.rsplit_once('.') {
        Some((stem, ext)) if ext == "exe" || ext == "msi" => (stem, ext),
        _ => (rest, ""),
    };

    let (rest, arch) = rest.rsplit_once('-')?;
    let (version, platform) = rest.rsplit_once('-')?;

    for segment in [component, version, platform, arch] {
        if !is_safe_segment(segment) {
            return None;
        }
    }

    Some(AssetParts {
        component,
        version,
        platform,
        arch,
        ext,
    })
}

/// Path-traversal guard: segments are limited to `[A-Za-z0-9._-]`, must be
/// non-empty, and may not contain `..` or start with a dot.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.contains("..")
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::services::release_source::UpstreamAsset;
    use crate::store::{memory_pool, SigningKeyStore};

    #[test]
    fn tag_parsing() {
        assert_eq!(parse_release_tag("agent-v1.2.3"), Some(("agent", "1.2.3")));
        assert_eq!(parse_release_tag("server-v0.9.0"), Some(("server", "0.9.0")));
        assert_eq!(parse_release_tag("v1.2.3"), None);
        assert_eq!(parse_release_tag("agent-1.2.3"), None);
        assert_eq!(parse_release_tag("agent-v../../etc"), None);
    }

    #[test]
    fn asset_parsing() {
        let parts = parse_asset_name("printmaster-agent-v1.2.3-linux-x86_64").unwrap();
        assert_eq!(parts.component, "agent");
        assert_eq!(parts.version, "1.2.3");
        assert_eq!(parts.platform, "linux");
        assert_eq!(parts.arch, "x86_64");
        assert_eq!(parts.ext, "");

        let exe = parse_asset_name("printmaster-agent-v2.0.0-windows-x86_64.exe").unwrap();
        assert_eq!(exe.ext, "exe");
        assert_eq!(exe.platform, "windows");

        let msi = parse_asset_name("printmaster-agent-v2.0.0-windows-aarch64.msi").unwrap();
        assert_eq!(msi.ext, "msi");

        assert!(parse_asset_name("other-agent-v1.0.0-linux-x86_64").is_none());
        assert!(parse_asset_name("printmaster-agent-v1.0.0-..-x86_64").is_none());
        assert!(parse_asset_name("printmaster-agent-v1.0.0-lin/ux-x86_64").is_none());
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_segment("x86_64"));
        assert!(is_safe_segment("1.2.3"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment(".hidden"));
        assert!(!is_safe_segment("a..b"));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment("a b"));
    }

    // ── Pass behavior with a canned source ───────────────────

    struct MockSource {
        releases: Vec<UpstreamRelease>,
        /// url → payload bytes
        payloads: HashMap<String, Vec<u8>>,
        downloads: Mutex<Vec<String>>,
    }

    impl ReleaseSource for MockSource {
        async fn recent_releases(&self, _count: u32) -> anyhow::Result<Vec<UpstreamRelease>> {
            Ok(self.releases.clone())
        }

        async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<(String, i64)> {
            self.downloads.lock().unwrap().push(url.to_string());
            let bytes = self
                .payloads
                .get(url)
                .ok_or_else(|| anyhow::anyhow!("404: {url}"))?;
            tokio::fs::write(dest, bytes).await?;
            use sha2::{Digest, Sha256};
            Ok((hex::encode(Sha256::digest(bytes)), bytes.len() as i64))
        }
    }

    fn release(tag: &str, assets: Vec<UpstreamAsset>) -> UpstreamRelease {
        UpstreamRelease {
            tag: tag.to_string(),
            draft: false,
            prerelease: false,
            published_at: Utc::now(),
            notes: "notes".into(),
            assets,
        }
    }

    fn asset(name: &str, url: &str) -> UpstreamAsset {
        UpstreamAsset {
            name: name.to_string(),
            download_url: url.to_string(),
            size: 16,
        }
    }

    async fn intake(source: MockSource, cache_dir: &Path, max_releases: u32) -> ReleaseIntake<MockSource> {
        let pool = memory_pool().await;
        let artifacts = ArtifactStore::new(pool.clone());
        let manifests = ManifestStore::new(pool.clone());
        let signer = Arc::new(ManifestSigner::new(
            SigningKeyStore::new(pool),
            manifests.clone(),
        ));
        ReleaseIntake::new(
            source,
            artifacts,
            manifests,
            signer,
            IntakeConfig {
                cache_dir: cache_dir.to_path_buf(),
                max_releases,
                channel: "stable".into(),
            },
        )
    }

    #[tokio::test]
    async fn pass_downloads_signs_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = MockSource {
            releases: vec![release(
                "agent-v1.0.0",
                vec![asset(
                    "printmaster-agent-v1.0.0-linux-x86_64",
                    "https://up/agent-1.0.0",
                )],
            )],
            payloads: HashMap::from([(
                "https://up/agent-1.0.0".to_string(),
                b"new-agent-binary".to_vec(),
            )]),
            downloads: Mutex::new(Vec::new()),
        };
        let intake = intake(source, dir.path(), 5).await;

        let stats = intake.run_pass().await.unwrap();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 0);

        let key = ArtifactKey {
            component: "agent".into(),
            version: "1.0.0".into(),
            platform: "linux".into(),
            arch: "x86_64".into(),
        };
        let artifact = intake.artifacts.get(&key).await.unwrap();
        assert_eq!(artifact.size_bytes, 16);
        assert_eq!(artifact.sha256.len(), 64);
        assert!(std::fs::read(&artifact.cache_path).unwrap() == b"new-agent-binary");
        assert!(intake.manifests.find(&key).await.unwrap().is_some());

        // Second pass refreshes metadata only — no new download.
        let stats = intake.run_pass().await.unwrap();
        assert_eq!(stats.downloaded, 0);
        assert_eq!(stats.refreshed, 1);
        assert_eq!(intake.source.downloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_release_does_not_abort_pass() {
        let dir = tempfile::tempdir().unwrap();
        let source = MockSource {
            releases: vec![
                release(
                    "agent-v1.0.0",
                    vec![asset("printmaster-agent-v1.0.0-linux-x86_64", "https://up/missing")],
                ),
                release(
                    "agent-v1.1.0",
                    vec![asset("printmaster-agent-v1.1.0-linux-x86_64", "https://up/ok")],
                ),
            ],
            payloads: HashMap::from([("https://up/ok".to_string(), b"good".to_vec())]),
            downloads: Mutex::new(Vec::new()),
        };
        let intake = intake(source, dir.path(), 0).await;

        let stats = intake.run_pass().await.unwrap();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn drafts_prereleases_and_foreign_tags_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut draft = release(
            "agent-v9.0.0",
            vec![asset("printmaster-agent-v9.0.0-linux-x86_64", "https://up/draft")],
        );
        draft.draft = true;
        let mut pre = release(
            "agent-v8.0.0-rc.1",
            vec![asset("printmaster-agent-v8.0.0-rc.1-linux-x86_64", "https://up/pre")],
        );
        pre.prerelease = true;
        let foreign = release("website-v1.0.0", vec![]);

        let source = MockSource {
            releases: vec![draft, pre, foreign],
            payloads: HashMap::new(),
            downloads: Mutex::new(Vec::new()),
        };
        let intake = intake(source, dir.path(), 0).await;

        let stats = intake.run_pass().await.unwrap();
        assert_eq!(stats, PassStats::default());
    }

    #[tokio::test]
    async fn retention_prunes_oldest_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut releases = Vec::new();
        let mut payloads = HashMap::new();
        for v in ["1.0.0", "1.1.0", "1.2.0"] {
            let url = format!("https://up/{v}");
            releases.push(release(
                &format!("agent-v{v}"),
                vec![asset(&format!("printmaster-agent-v{v}-linux-x86_64"), &url)],
            ));
            payloads.insert(url, format!("payload-{v}").into_bytes());
        }
        let source = MockSource {
            releases,
            payloads,
            downloads: Mutex::new(Vec::new()),
        };
        let intake = intake(source, dir.path(), 2).await;

        let stats = intake.run_pass().await.unwrap();
        assert_eq!(stats.downloaded, 3);
        assert_eq!(stats.pruned_versions, 1);

        let versions = intake.artifacts.versions("agent").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(!versions.contains(&"1.0.0".to_string()));

        // The pruned cache file is gone too.
        let pruned_path = dir.path().join("agent/1.0.0/printmaster-agent-v1.0.0-linux-x86_64");
        assert!(!pruned_path.exists());
    }
}
