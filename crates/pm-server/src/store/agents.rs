//! Agent inventory rows, bearer-token validation, and the fleet policy blob.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use pm_common::AppResult;
use pm_protocol::PolicySpec;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AgentRow {
    pub id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AgentStore {
    db: SqlitePool,
}

/// SHA-256 hex of a bearer token, the only form the server stores.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl AgentStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Validate a bearer token against stored hashes. Returns the agent id
    /// bound to the token, if any.
    pub async fn validate_token(&self, token: &str) -> AppResult<Option<String>> {
        let hash = hash_token(token);
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT agent_id FROM agent_tokens WHERE token_hash = ?1 AND revoked = 0",
        )
        .bind(&hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|(agent_id,)| agent_id.unwrap_or_default()))
    }

    /// Register a token hash (enrollment helper / tests).
    pub async fn insert_token(&self, token: &str, agent_id: Option<&str>, notes: &str) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO agent_tokens (id, token_hash, agent_id, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(hash_token(token))
        .bind(agent_id)
        .bind(notes)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Upsert the inventory row on connect/heartbeat and mark it online.
    pub async fn mark_online(
        &self,
        agent_id: &str,
        hostname: &str,
        os: &str,
        arch: &str,
        agent_version: &str,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO agents (id, hostname, os, arch, agent_version, status, last_seen, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'online', ?6, ?6)
            ON CONFLICT (id) DO UPDATE SET
                hostname = excluded.hostname,
                os = excluded.os,
                arch = excluded.arch,
                agent_version = excluded.agent_version,
                status = 'online',
                last_seen = excluded.last_seen
            "#,
        )
        .bind(agent_id)
        .bind(hostname)
        .bind(os)
        .bind(arch)
        .bind(agent_version)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn touch_last_seen(&self, agent_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE agents SET last_seen = ?2, status = 'online' WHERE id = ?1")
            .bind(agent_id)
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_offline(&self, agent_id: &str) -> AppResult<()> {
        sqlx::query("UPDATE agents SET status = 'offline' WHERE id = ?1")
            .bind(agent_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Mark agents offline whose last_seen is older than `timeout_secs`.
    /// Returns the ids that flipped.
    pub async fn expire_stale(&self, timeout_secs: i64) -> AppResult<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_secs);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM agents WHERE status = 'online' AND last_seen < ?1",
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?;

        for (id,) in &rows {
            self.mark_offline(id).await?;
        }
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn list(&self, limit: i64) -> AppResult<Vec<AgentRow>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM agents ORDER BY last_seen DESC LIMIT ?1",
        )
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    pub async fn get(&self, agent_id: &str) -> AppResult<Option<AgentRow>> {
        let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row)
    }

    pub async fn delete(&self, agent_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM agents WHERE id = ?1")
            .bind(agent_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Remove a device row reported deleted by its agent.
    pub async fn delete_device(&self, device_id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM devices WHERE id = ?1")
            .bind(device_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    // ─── Fleet policy ────────────────────────────────────────

    /// Load the fleet-wide update policy, if one is stored.
    pub async fn fleet_policy(&self) -> AppResult<Option<PolicySpec>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM server_config WHERE key = 'fleet_update_policy'")
                .fetch_optional(&self.db)
                .await?;
        Ok(row.and_then(|(json,)| serde_json::from_str(&json).ok()))
    }

    pub async fn set_fleet_policy(&self, policy: &PolicySpec) -> AppResult<()> {
        let json = serde_json::to_string(policy)
            .map_err(|e| anyhow::anyhow!("serialize fleet policy: {e}"))?;
        sqlx::query(
            "INSERT INTO server_config (key, value, updated_at)
             VALUES ('fleet_update_policy', ?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = ?1, updated_at = ?2",
        )
        .bind(&json)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn token_validation_uses_hashes() {
        let store = AgentStore::new(memory_pool().await);
        store.insert_token("secret-token", Some("a-1"), "").await.unwrap();

        assert_eq!(
            store.validate_token("secret-token").await.unwrap(),
            Some("a-1".to_string())
        );
        assert_eq!(store.validate_token("wrong").await.unwrap(), None);
    }

    #[tokio::test]
    async fn online_offline_lifecycle() {
        let store = AgentStore::new(memory_pool().await);
        store
            .mark_online("a-1", "host1", "linux", "x86_64", "1.0.0")
            .await
            .unwrap();

        let row = store.get("a-1").await.unwrap().unwrap();
        assert_eq!(row.status, "online");

        store.mark_offline("a-1").await.unwrap();
        let row = store.get("a-1").await.unwrap().unwrap();
        assert_eq!(row.status, "offline");
    }

    #[tokio::test]
    async fn fleet_policy_round_trip() {
        let store = AgentStore::new(memory_pool().await);
        assert!(store.fleet_policy().await.unwrap().is_none());

        let policy = PolicySpec {
            update_check_days: 7,
            ..Default::default()
        };
        store.set_fleet_policy(&policy).await.unwrap();
        assert_eq!(store.fleet_policy().await.unwrap(), Some(policy));
    }
}
