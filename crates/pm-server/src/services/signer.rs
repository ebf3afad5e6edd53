//! Manifest signer — canonicalizes an artifact's manifest payload, signs it
//! with the active Ed25519 key, and persists the envelope.
//!
//! The active-key read and the sign-then-upsert sequence run under one mutex
//! so two concurrent signers cannot observe different active keys. The
//! exactly-one-active invariant itself lives in the key store's transaction.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey as DalekSigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tokio::sync::Mutex;
use uuid::Uuid;

use pm_common::{version, AppError, AppResult};
use pm_protocol::{ManifestPayload, MANIFEST_VERSION};

use crate::store::signing_keys::KeyMaterial;
use crate::store::{ReleaseArtifact, ReleaseManifest, ManifestStore, SigningKey, SigningKeyInfo, SigningKeyStore};

pub struct ManifestSigner {
    keys: SigningKeyStore,
    manifests: ManifestStore,
    lock: Mutex<()>,
}

impl ManifestSigner {
    pub fn new(keys: SigningKeyStore, manifests: ManifestStore) -> Self {
        Self {
            keys,
            manifests,
            lock: Mutex::new(()),
        }
    }

    /// Generate, persist, and activate a fresh keypair.
    pub async fn rotate_key(&self, notes: &str) -> AppResult<SigningKeyInfo> {
        let signing = DalekSigningKey::generate(&mut OsRng);
        let material = KeyMaterial {
            public_key: B64.encode(signing.verifying_key().to_bytes()),
            private_key: B64.encode(signing.to_bytes()),
        };
        let key = self.keys.create(material, notes).await?;
        self.keys.activate(&key.id).await?;
        tracing::info!(key_id = %key.id, "Signing key rotated");
        Ok(key.into())
    }

    /// The active key, creating and activating one on first use.
    async fn active_key(&self) -> AppResult<SigningKey> {
        match self.keys.get_active_full().await {
            Ok(key) => Ok(key),
            Err(AppError::NotFound(_)) => {
                self.rotate_key("auto-created on first sign").await?;
                self.keys.get_active_full().await
            }
            Err(e) => Err(e),
        }
    }

    /// Idempotent: returns the stored envelope unchanged when it was signed
    /// by the current active key, otherwise (re-)signs the artifact.
    pub async fn ensure_manifest_for_artifact(
        &self,
        artifact: &ReleaseArtifact,
    ) -> AppResult<ReleaseManifest> {
        let _guard = self.lock.lock().await;
        let key = self.active_key().await?;

        if let Some(existing) = self.manifests.find(&artifact.key()).await? {
            if existing.signing_key_id == key.id && !existing.signature.is_empty() {
                return Ok(existing);
            }
        }

        self.sign_locked(artifact, &key).await
    }

    /// Sign unconditionally (still serialized on the signer mutex).
    pub async fn sign_artifact(&self, artifact: &ReleaseArtifact) -> AppResult<ReleaseManifest> {
        let _guard = self.lock.lock().await;
        let key = self.active_key().await?;
        self.sign_locked(artifact, &key).await
    }

    async fn sign_locked(
        &self,
        artifact: &ReleaseArtifact,
        key: &SigningKey,
    ) -> AppResult<ReleaseManifest> {
        if artifact.sha256.is_empty() || artifact.source_url.is_empty() {
            return Err(AppError::BadRequest(format!(
                "incomplete artifact {}-{}: sha256 and source_url are required before signing",
                artifact.component, artifact.version
            )));
        }

        let payload = ManifestPayload {
            manifest_version: MANIFEST_VERSION,
            component: artifact.component.clone(),
            version: artifact.version.clone(),
            minor_line: version::minor_line(&artifact.version),
            platform: artifact.platform.clone(),
            arch: artifact.arch.clone(),
            channel: artifact.channel.clone(),
            sha256: artifact.sha256.to_lowercase(),
            size_bytes: artifact.size_bytes,
            source_url: artifact.source_url.clone(),
            published_at: artifact.published_at,
            generated_at: Utc::now(),
        };

        let bytes = payload
            .canonical_json()
            .map_err(|e| anyhow::anyhow!("serialize manifest payload: {e}"))?;
        let signature = self.sign_bytes(key, &bytes)?;

        let existing_id = self
            .manifests
            .find(&artifact.key())
            .await?
            .map(|m| m.id);

        let manifest = ReleaseManifest {
            id: String::new(),
            manifest_version: MANIFEST_VERSION as i64,
            component: payload.component.clone(),
            version: payload.version.clone(),
            platform: payload.platform.clone(),
            arch: payload.arch.clone(),
            channel: payload.channel.clone(),
            manifest_json: String::from_utf8(bytes)
                .map_err(|e| anyhow::anyhow!("manifest payload not utf-8: {e}"))?,
            signature,
            signing_key_id: key.id.clone(),
            generated_at: payload.generated_at,
        }
        .with_id(existing_id);

        self.manifests.upsert(&manifest).await?;
        tracing::debug!(
            component = %manifest.component,
            version = %manifest.version,
            platform = %manifest.platform,
            arch = %manifest.arch,
            key_id = %key.id,
            "Manifest signed"
        );
        Ok(manifest)
    }

    /// Re-sign every stored manifest under the current active key. Post-
    /// rotation fix-up; identity tuples are untouched, `generated_at` moves.
    pub async fn regenerate_manifests(&self) -> AppResult<usize> {
        let _guard = self.lock.lock().await;
        let key = self.active_key().await?;
        let all = self.manifests.all().await?;
        let mut count = 0usize;

        for stored in all {
            let payload: ManifestPayload = match serde_json::from_str(&stored.manifest_json) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(
                        manifest_id = %stored.id,
                        "Skipping unparsable stored manifest payload: {}",
                        e
                    );
                    continue;
                }
            };

            // Reconstruct the artifact view from the stored payload.
            let artifact = ReleaseArtifact {
                id: Uuid::new_v4().to_string(),
                component: payload.component,
                version: payload.version,
                platform: payload.platform,
                arch: payload.arch,
                channel: payload.channel,
                source_url: payload.source_url,
                cache_path: String::new(),
                sha256: payload.sha256,
                size_bytes: payload.size_bytes,
                published_at: payload.published_at,
                downloaded_at: None,
                release_notes: String::new(),
            };

            self.sign_locked(&artifact, &key).await?;
            count += 1;
        }

        tracing::info!(count, key_id = %key.id, "Manifests regenerated");
        Ok(count)
    }

    fn sign_bytes(&self, key: &SigningKey, bytes: &[u8]) -> AppResult<String> {
        let raw = B64
            .decode(&key.private_key)
            .map_err(|e| anyhow::anyhow!("decode private key: {e}"))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key is not 32 bytes"))?;
        let signing = DalekSigningKey::from_bytes(&raw);
        Ok(B64.encode(signing.sign(bytes).to_bytes()))
    }
}

/// Verify an envelope's signature against a base64 public key.
pub fn verify_manifest(manifest_json: &str, signature_b64: &str, public_key_b64: &str) -> bool {
    let Ok(pk_raw) = B64.decode(public_key_b64) else {
        return false;
    };
    let Ok(pk_raw) = <[u8; 32]>::try_from(pk_raw) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pk_raw) else {
        return false;
    };
    let Ok(sig_raw) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_raw) = <[u8; 64]>::try_from(sig_raw) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_raw);
    key.verify(manifest_json.as_bytes(), &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::artifacts::ArtifactKey;
    use crate::store::memory_pool;

    fn artifact(version: &str) -> ReleaseArtifact {
        let mut a = ReleaseArtifact::new(
            ArtifactKey {
                component: "agent".into(),
                version: version.into(),
                platform: "linux".into(),
                arch: "x86_64".into(),
            },
            "stable",
            "https://example.com/agent",
            Utc::now(),
        );
        a.sha256 = "cd".repeat(32);
        a.size_bytes = 16;
        a
    }

    async fn signer() -> (ManifestSigner, SigningKeyStore) {
        let pool = memory_pool().await;
        let keys = SigningKeyStore::new(pool.clone());
        (
            ManifestSigner::new(keys.clone(), ManifestStore::new(pool)),
            keys,
        )
    }

    #[tokio::test]
    async fn signing_produces_verifiable_envelope() {
        let (signer, keys) = signer().await;
        let manifest = signer.sign_artifact(&artifact("1.0.0")).await.unwrap();

        let public = keys.public_key(&manifest.signing_key_id).await.unwrap();
        assert!(verify_manifest(&manifest.manifest_json, &manifest.signature, &public));
        // Tampered payload fails.
        assert!(!verify_manifest(
            &manifest.manifest_json.replace("1.0.0", "1.0.1"),
            &manifest.signature,
            &public
        ));
    }

    #[tokio::test]
    async fn ensure_is_idempotent_under_unchanged_key() {
        let (signer, _) = signer().await;
        let a = artifact("1.2.0");
        let first = signer.ensure_manifest_for_artifact(&a).await.unwrap();
        let second = signer.ensure_manifest_for_artifact(&a).await.unwrap();
        assert_eq!(first.signature, second.signature);
        assert_eq!(first.generated_at, second.generated_at);
    }

    #[tokio::test]
    async fn incomplete_artifact_is_rejected() {
        let (signer, _) = signer().await;
        let mut a = artifact("1.0.0");
        a.sha256 = String::new();
        let err = signer.sign_artifact(&a).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn rotate_and_regenerate_reseats_every_envelope() {
        let pool = memory_pool().await;
        let keys = SigningKeyStore::new(pool.clone());
        let manifests = ManifestStore::new(pool);
        let signer = ManifestSigner::new(keys.clone(), manifests.clone());

        let original = signer.sign_artifact(&artifact("1.0.0")).await.unwrap();
        let k1_public = keys.public_key(&original.signing_key_id).await.unwrap();

        let k2 = signer.rotate_key("rotation test").await.unwrap();
        assert_eq!(keys.active_count().await.unwrap(), 1);

        let count = signer.regenerate_manifests().await.unwrap();
        assert_eq!(count, 1);

        let regenerated = manifests.find(&original.key()).await.unwrap().unwrap();
        assert_eq!(regenerated.signing_key_id, k2.id);
        assert_eq!(regenerated.key(), original.key());
        assert!(verify_manifest(
            &regenerated.manifest_json,
            &regenerated.signature,
            &k2.public_key
        ));
        // The old key no longer validates the new envelope.
        assert!(!verify_manifest(
            &regenerated.manifest_json,
            &regenerated.signature,
            &k1_public
        ));
    }

    #[tokio::test]
    async fn first_sign_creates_a_key() {
        let (signer, keys) = signer().await;
        signer.sign_artifact(&artifact("0.1.0")).await.unwrap();
        assert_eq!(keys.active_count().await.unwrap(), 1);
    }
}
