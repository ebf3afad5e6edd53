//! Signed release-manifest envelopes, one per artifact identity tuple.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use pm_common::AppResult;

use super::artifacts::ArtifactKey;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReleaseManifest {
    pub id: String,
    pub manifest_version: i64,
    pub component: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub channel: String,
    /// The exact bytes that were signed.
    pub manifest_json: String,
    /// Base64 Ed25519 signature over `manifest_json`.
    pub signature: String,
    pub signing_key_id: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ManifestStore {
    db: SqlitePool,
}

impl ManifestStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert or replace the envelope for the artifact's identity tuple.
    pub async fn upsert(&self, m: &ReleaseManifest) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO release_manifests
                (id, manifest_version, component, version, platform, arch, channel,
                 manifest_json, signature, signing_key_id, generated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (component, version, platform, arch) DO UPDATE SET
                manifest_version = excluded.manifest_version,
                channel = excluded.channel,
                manifest_json = excluded.manifest_json,
                signature = excluded.signature,
                signing_key_id = excluded.signing_key_id,
                generated_at = excluded.generated_at
            "#,
        )
        .bind(&m.id)
        .bind(m.manifest_version)
        .bind(&m.component)
        .bind(&m.version)
        .bind(&m.platform)
        .bind(&m.arch)
        .bind(&m.channel)
        .bind(&m.manifest_json)
        .bind(&m.signature)
        .bind(&m.signing_key_id)
        .bind(m.generated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn find(&self, key: &ArtifactKey) -> AppResult<Option<ReleaseManifest>> {
        let row = sqlx::query_as::<_, ReleaseManifest>(
            "SELECT * FROM release_manifests
             WHERE component = ?1 AND version = ?2 AND platform = ?3 AND arch = ?4",
        )
        .bind(&key.component)
        .bind(&key.version)
        .bind(&key.platform)
        .bind(&key.arch)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    /// Every manifest for a component. The latest-manifest selector needs
    /// the full set — semver ordering cannot be pushed into SQL.
    pub async fn for_component(&self, component: &str) -> AppResult<Vec<ReleaseManifest>> {
        let rows = sqlx::query_as::<_, ReleaseManifest>(
            "SELECT * FROM release_manifests WHERE component = ?1",
        )
        .bind(component)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn all(&self) -> AppResult<Vec<ReleaseManifest>> {
        let rows = sqlx::query_as::<_, ReleaseManifest>("SELECT * FROM release_manifests")
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    pub async fn delete_version(&self, component: &str, version: &str) -> AppResult<u64> {
        let res = sqlx::query(
            "DELETE FROM release_manifests WHERE component = ?1 AND version = ?2",
        )
        .bind(component)
        .bind(version)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }
}

impl ReleaseManifest {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            component: self.component.clone(),
            version: self.version.clone(),
            platform: self.platform.clone(),
            arch: self.arch.clone(),
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self
    }
}
