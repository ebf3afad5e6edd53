//! Latest-manifest selection for agents.
//!
//! Given (component, platform, arch, channel), pick the stored envelope with
//! the greatest version under semver ordering and attach a download URL.

use std::path::Path;

use pm_common::{version, AppError, AppResult};
use pm_protocol::SignedManifest;

use crate::services::signer::verify_manifest;
use crate::store::{ArtifactStore, ManifestStore, ReleaseManifest, SigningKeyStore};

#[derive(Clone)]
pub struct ManifestQuery {
    manifests: ManifestStore,
    artifacts: ArtifactStore,
    /// Key store is used for verification only: a stored envelope that no
    /// longer validates is never handed to an agent.
    keys: SigningKeyStore,
    /// Externally reachable base URL; download URLs are relative when unset.
    public_url: Option<String>,
}

impl ManifestQuery {
    pub fn new(
        manifests: ManifestStore,
        artifacts: ArtifactStore,
        keys: SigningKeyStore,
        public_url: Option<String>,
    ) -> Self {
        Self {
            manifests,
            artifacts,
            keys,
            public_url,
        }
    }

    /// The greatest-version signed manifest matching the filter, or
    /// `NotFound` when nothing matches.
    pub async fn get_latest(
        &self,
        component: &str,
        platform: &str,
        arch: &str,
        channel: &str,
    ) -> AppResult<SignedManifest> {
        let candidates = self.manifests.for_component(component).await?;

        let best = candidates
            .into_iter()
            .filter(|m| m.platform == platform && m.arch == arch)
            .filter(|m| channel.is_empty() || m.channel == channel)
            .max_by(|a, b| version::compare(&a.version, &b.version));

        let Some(best) = best else {
            return Err(AppError::NotFound(format!(
                "no manifest for {component} on {platform}/{arch} channel '{channel}'"
            )));
        };

        let public_key = self.keys.public_key(&best.signing_key_id).await?;
        if !verify_manifest(&best.manifest_json, &best.signature, &public_key) {
            tracing::error!(
                component = %best.component,
                version = %best.version,
                key_id = %best.signing_key_id,
                "Stored manifest fails signature verification"
            );
            return Err(AppError::Internal(anyhow::anyhow!(
                "stored manifest for {component} {} fails verification",
                best.version
            )));
        }

        Ok(SignedManifest {
            download_url: self.download_url(&best).await,
            manifest_json: best.manifest_json,
            signature: best.signature,
            signing_key_id: best.signing_key_id,
        })
    }

    /// Prefer the locally cached artifact; fall back to the upstream source
    /// URL when the cache file never landed.
    async fn download_url(&self, manifest: &ReleaseManifest) -> String {
        let artifact = self.artifacts.find(&manifest.key()).await.ok().flatten();

        if let Some(a) = &artifact {
            if !a.cache_path.is_empty() {
                if let Some(name) = Path::new(&a.cache_path).file_name().and_then(|n| n.to_str()) {
                    let base = self.public_url.as_deref().unwrap_or("").trim_end_matches('/');
                    return format!("{base}/api/artifacts/{name}");
                }
            }
        }

        artifact.map(|a| a.source_url).unwrap_or_default()
    }
}
