//! Ed25519 signing-key persistence.
//!
//! At most one key is active at a time; activation flips the previous active
//! key off inside the same transaction. Keys are never mutated after
//! creation, only deactivated by activating another.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use pm_common::{AppError, AppResult};

/// Full key row, private material included. Only the manifest signer asks
/// for this form; everything else gets [`SigningKeyInfo`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SigningKey {
    pub id: String,
    pub algorithm: String,
    /// Base64-encoded public key bytes.
    pub public_key: String,
    /// Base64-encoded private key bytes. Sensitive.
    pub private_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub notes: String,
}

/// Sanitized projection of a signing key for any read crossing the
/// component boundary.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SigningKeyInfo {
    pub id: String,
    pub algorithm: String,
    pub public_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub notes: String,
}

impl From<SigningKey> for SigningKeyInfo {
    fn from(k: SigningKey) -> Self {
        Self {
            id: k.id,
            algorithm: k.algorithm,
            public_key: k.public_key,
            active: k.active,
            created_at: k.created_at,
            rotated_at: k.rotated_at,
            notes: k.notes,
        }
    }
}

/// Freshly generated key material to persist.
pub struct KeyMaterial {
    pub public_key: String,
    pub private_key: String,
}

#[derive(Clone)]
pub struct SigningKeyStore {
    db: SqlitePool,
}

impl SigningKeyStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Persist a new (inactive) key.
    pub async fn create(&self, material: KeyMaterial, notes: &str) -> AppResult<SigningKey> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO signing_keys (id, algorithm, public_key, private_key, active, created_at, notes)
             VALUES (?1, 'ed25519', ?2, ?3, 0, ?4, ?5)",
        )
        .bind(&id)
        .bind(&material.public_key)
        .bind(&material.private_key)
        .bind(now)
        .bind(notes)
        .execute(&self.db)
        .await?;

        self.get_full(&id).await
    }

    /// Make `id` the single active key. The previous active key (if any) is
    /// deactivated and stamped `rotated_at` in the same transaction.
    pub async fn activate(&self, id: &str) -> AppResult<()> {
        let mut tx = self.db.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM signing_keys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("no such signing key: {id}")));
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE signing_keys SET active = 0, rotated_at = ?1 WHERE active = 1 AND id != ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE signing_keys SET active = 1 WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(key_id = %id, "Signing key activated");
        Ok(())
    }

    /// The active key with private material. Fails with `NotFound` when no
    /// key is active; callers are expected to create one then.
    pub async fn get_active_full(&self) -> AppResult<SigningKey> {
        sqlx::query_as::<_, SigningKey>("SELECT * FROM signing_keys WHERE active = 1")
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("no active signing key".into()))
    }

    /// Sanitized view of the active key.
    pub async fn get_active(&self) -> AppResult<SigningKeyInfo> {
        self.get_active_full().await.map(Into::into)
    }

    async fn get_full(&self, id: &str) -> AppResult<SigningKey> {
        sqlx::query_as::<_, SigningKey>("SELECT * FROM signing_keys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no such signing key: {id}")))
    }

    /// Sanitized single-key lookup.
    pub async fn get(&self, id: &str) -> AppResult<SigningKeyInfo> {
        self.get_full(id).await.map(Into::into)
    }

    /// Public key material for verification, by id.
    pub async fn public_key(&self, id: &str) -> AppResult<String> {
        Ok(self.get(id).await?.public_key)
    }

    /// Newest-first sanitized listing.
    pub async fn list(&self, limit: i64) -> AppResult<Vec<SigningKeyInfo>> {
        let rows = sqlx::query_as::<_, SigningKeyInfo>(
            "SELECT id, algorithm, public_key, active, created_at, rotated_at, notes
             FROM signing_keys ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Count of rows with `active = 1`. Diagnostic; the invariant says this
    /// is always 0 or 1.
    pub async fn active_count(&self) -> AppResult<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signing_keys WHERE active = 1")
            .fetch_one(&self.db)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    fn material(tag: u8) -> KeyMaterial {
        KeyMaterial {
            public_key: format!("pub-{tag}"),
            private_key: format!("priv-{tag}"),
        }
    }

    #[tokio::test]
    async fn activate_is_exclusive() {
        let store = SigningKeyStore::new(memory_pool().await);

        let k1 = store.create(material(1), "first").await.unwrap();
        let k2 = store.create(material(2), "second").await.unwrap();

        store.activate(&k1.id).await.unwrap();
        assert_eq!(store.active_count().await.unwrap(), 1);
        assert_eq!(store.get_active().await.unwrap().id, k1.id);

        store.activate(&k2.id).await.unwrap();
        assert_eq!(store.active_count().await.unwrap(), 1);
        assert_eq!(store.get_active().await.unwrap().id, k2.id);

        // The deactivated key carries a rotation stamp.
        let old = store.get(&k1.id).await.unwrap();
        assert!(!old.active);
        assert!(old.rotated_at.is_some());
    }

    #[tokio::test]
    async fn schema_rejects_a_second_active_key() {
        let pool = memory_pool().await;
        let store = SigningKeyStore::new(pool.clone());

        let k1 = store.create(material(1), "").await.unwrap();
        let k2 = store.create(material(2), "").await.unwrap();
        store.activate(&k1.id).await.unwrap();

        // Flipping a second row active behind the store's back trips the
        // partial unique index.
        let err = sqlx::query("UPDATE signing_keys SET active = 1 WHERE id = ?1")
            .bind(&k2.id)
            .execute(&pool)
            .await;
        assert!(err.is_err());
        assert_eq!(store.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn activate_unknown_key_fails() {
        let store = SigningKeyStore::new(memory_pool().await);
        let err = store.activate("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn no_active_key_is_not_found() {
        let store = SigningKeyStore::new(memory_pool().await);
        store.create(material(1), "").await.unwrap();
        let err = store.get_active().await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn sanitized_reads_have_no_private_material() {
        let store = SigningKeyStore::new(memory_pool().await);
        let k = store.create(material(9), "").await.unwrap();
        store.activate(&k.id).await.unwrap();

        let info = store.get_active().await.unwrap();
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("priv-9"));
        assert!(json.contains("pub-9"));
    }
}
