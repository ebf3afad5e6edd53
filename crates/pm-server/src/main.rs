//! # PrintMaster Server
//!
//! Fleet-management server: aggregates inventory and telemetry from remote
//! agents over the WebSocket control channel, ingests upstream releases into
//! a signed-manifest store, and serves signed update manifests and cached
//! artifacts to the fleet.

mod api;
mod services;
mod store;
mod workers;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use services::manifest_query::ManifestQuery;
use services::signer::ManifestSigner;
use store::{AgentStore, ArtifactStore, AuditStore, ManifestStore, SigningKeyStore};
use ws::client_ip::ClientIpResolver;
use ws::hub::ControlHub;
use ws::ratelimit::{AuthRateLimiter, RateLimitConfig};

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: pm_common::AppConfig,
    pub agents: AgentStore,
    pub artifacts: ArtifactStore,
    pub manifests: ManifestStore,
    pub keys: SigningKeyStore,
    pub audit: AuditStore,
    pub signer: Arc<ManifestSigner>,
    pub query: ManifestQuery,
    pub hub: ControlHub,
    pub limiter: Arc<AuthRateLimiter>,
    pub ip_resolver: ClientIpResolver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting PrintMaster server...");

    // Load configuration
    let config = pm_common::AppConfig::load().expect("Failed to load configuration");

    // Connect to SQLite
    let connect_options: SqliteConnectOptions = config
        .database
        .url
        .parse::<SqliteConnectOptions>()?
        .create_if_missing(true);
    let db = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations applied");

    // Build stores and services
    let agents = AgentStore::new(db.clone());
    let artifacts = ArtifactStore::new(db.clone());
    let manifests = ManifestStore::new(db.clone());
    let keys = SigningKeyStore::new(db.clone());
    let audit = AuditStore::new(db.clone());
    let signer = Arc::new(ManifestSigner::new(keys.clone(), manifests.clone()));
    let query = ManifestQuery::new(
        manifests.clone(),
        artifacts.clone(),
        keys.clone(),
        config.server.public_url.clone(),
    );
    let ip_resolver = ClientIpResolver::new(
        &config.proxy.trusted_cidrs,
        config.proxy.trust_cloudflare,
    );

    // Build shared state
    let state = Arc::new(AppState {
        agents,
        artifacts,
        manifests,
        keys,
        audit,
        signer,
        query,
        hub: ControlHub::new(),
        limiter: Arc::new(AuthRateLimiter::new(RateLimitConfig::default())),
        ip_resolver,
        config: config.clone(),
    });

    // Start background workers
    let _worker_handles = workers::start_all_workers(state.clone());
    tracing::info!("Background workers started");

    // Build router
    let app = Router::new()
        .nest("/api", api::router(state.clone()))
        .nest("/ws", ws::router(state.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.api_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
}
