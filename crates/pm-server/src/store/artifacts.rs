//! Release-artifact rows: one per (component, version, platform, arch),
//! pointing at a file in the local content cache.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use pm_common::{AppError, AppResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReleaseArtifact {
    pub id: String,
    pub component: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub channel: String,
    pub source_url: String,
    pub cache_path: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub published_at: DateTime<Utc>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub release_notes: String,
}

/// Identity tuple for upserts and lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub component: String,
    pub version: String,
    pub platform: String,
    pub arch: String,
}

#[derive(Clone)]
pub struct ArtifactStore {
    db: SqlitePool,
}

impl ArtifactStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, artifact: &ReleaseArtifact) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO release_artifacts
                (id, component, version, platform, arch, channel, source_url,
                 cache_path, sha256, size_bytes, published_at, downloaded_at, release_notes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (component, version, platform, arch) DO UPDATE SET
                channel = excluded.channel,
                source_url = excluded.source_url,
                cache_path = excluded.cache_path,
                sha256 = excluded.sha256,
                size_bytes = excluded.size_bytes,
                published_at = excluded.published_at,
                downloaded_at = excluded.downloaded_at,
                release_notes = excluded.release_notes
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.component)
        .bind(&artifact.version)
        .bind(&artifact.platform)
        .bind(&artifact.arch)
        .bind(&artifact.channel)
        .bind(&artifact.source_url)
        .bind(&artifact.cache_path)
        .bind(&artifact.sha256)
        .bind(artifact.size_bytes)
        .bind(artifact.published_at)
        .bind(artifact.downloaded_at)
        .bind(&artifact.release_notes)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Refresh mutable metadata without touching the cached file fields.
    pub async fn update_metadata(
        &self,
        key: &ArtifactKey,
        source_url: &str,
        size_bytes: i64,
        published_at: DateTime<Utc>,
        release_notes: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE release_artifacts
             SET source_url = ?1, size_bytes = ?2, published_at = ?3, release_notes = ?4
             WHERE component = ?5 AND version = ?6 AND platform = ?7 AND arch = ?8",
        )
        .bind(source_url)
        .bind(size_bytes)
        .bind(published_at)
        .bind(release_notes)
        .bind(&key.component)
        .bind(&key.version)
        .bind(&key.platform)
        .bind(&key.arch)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn find(&self, key: &ArtifactKey) -> AppResult<Option<ReleaseArtifact>> {
        let row = sqlx::query_as::<_, ReleaseArtifact>(
            "SELECT * FROM release_artifacts
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

    pub async fn get(&self, key: &ArtifactKey) -> AppResult<ReleaseArtifact> {
        self.find(key).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "no artifact {}-{} for {}/{}",
                key.component, key.version, key.platform, key.arch
            ))
        })
    }

    /// Distinct versions for a component, used by retention pruning.
    pub async fn versions(&self, component: &str) -> AppResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT version FROM release_artifacts WHERE component = ?1",
        )
        .bind(component)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    /// All rows for one (component, version), across platforms.
    pub async fn for_version(
        &self,
        component: &str,
        version: &str,
    ) -> AppResult<Vec<ReleaseArtifact>> {
        let rows = sqlx::query_as::<_, ReleaseArtifact>(
            "SELECT * FROM release_artifacts WHERE component = ?1 AND version = ?2",
        )
        .bind(component)
        .bind(version)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn delete_version(&self, component: &str, version: &str) -> AppResult<u64> {
        let res = sqlx::query(
            "DELETE FROM release_artifacts WHERE component = ?1 AND version = ?2",
        )
        .bind(component)
        .bind(version)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn components(&self) -> AppResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT component FROM release_artifacts")
                .fetch_all(&self.db)
                .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }
}

impl ReleaseArtifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            component: self.component.clone(),
            version: self.version.clone(),
            platform: self.platform.clone(),
            arch: self.arch.clone(),
        }
    }

    /// New row with generated id; caller fills the cache fields after the
    /// download lands.
    pub fn new(key: ArtifactKey, channel: &str, source_url: &str, published_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            component: key.component,
            version: key.version,
            platform: key.platform,
            arch: key.arch,
            channel: channel.to_string(),
            source_url: source_url.to_string(),
            cache_path: String::new(),
            sha256: String::new(),
            size_bytes: 0,
            published_at,
            downloaded_at: None,
            release_notes: String::new(),
        }
    }
}
