//! Audit log — append-only record of key rotations, rate-limit blocks, and
//! agent update telemetry.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use pm_common::AppResult;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: String,
    pub agent_id: Option<String>,
    pub action: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditStore {
    db: SqlitePool,
}

impl AuditStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        agent_id: Option<&str>,
        action: &str,
        metadata: Option<serde_json::Value>,
    ) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, agent_id, action, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id)
        .bind(action)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    /// Delete entries older than `retention_days`. Returns rows removed.
    pub async fn prune(&self, retention_days: i64) -> AppResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let res = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn record_and_list() {
        let store = AuditStore::new(memory_pool().await);
        store
            .record(Some("a-1"), "update_progress", Some(serde_json::json!({"status": "downloading"})))
            .await
            .unwrap();
        store.record(None, "key_rotated", None).await.unwrap();

        let entries = store.list(10, 0).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.action == "key_rotated"));
    }
}
