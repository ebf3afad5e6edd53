//! SQLite persistence. One store value per table family, each owning a pool
//! handle so tests can instantiate parallel copies against `sqlite::memory:`.

pub mod agents;
pub mod artifacts;
pub mod audit;
pub mod manifests;
pub mod signing_keys;

pub use agents::AgentStore;
pub use artifacts::{ArtifactStore, ReleaseArtifact};
pub use audit::AuditStore;
pub use manifests::{ManifestStore, ReleaseManifest};
pub use signing_keys::{SigningKey, SigningKeyInfo, SigningKeyStore};

/// Open an in-memory database with the schema applied. Test helper.
/// Single connection — every pooled connection to `sqlite::memory:` would
/// otherwise see its own empty database.
#[cfg(test)]
pub async fn memory_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}
