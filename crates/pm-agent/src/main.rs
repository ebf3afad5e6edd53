//! # PrintMaster Agent
//!
//! Per-host agent: keeps a control-channel session to the fleet server,
//! ships heartbeats and update telemetry, and self-updates from the
//! server's signed manifests.
//!
//! ## Usage
//!
//! ```sh
//! pm-agent                # Run in foreground (default)
//! pm-agent run            # Same as above
//! pm-agent check-now      # One-shot update check, then exit
//! pm-agent force-install  # Install whatever the server serves, then exit
//! pm-agent version        # Print version info
//! ```

mod client;
mod connection;
mod policy;
mod telemetry;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use client::HttpUpdateClient;
use connection::Connection;
use policy::{OverrideMode, SharedPolicy};
use telemetry::ControlChannelSink;
use update::manager::{ManagerConfig, UpdateManager};

fn data_dir(cfg: &pm_common::AgentConfig) -> PathBuf {
    match &cfg.data_dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("printmaster"),
    }
}

/// Stable per-host identity, persisted across restarts and updates.
fn load_or_create_agent_id(data_dir: &std::path::Path) -> anyhow::Result<String> {
    let path = data_dir.join("agent_id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    Ok(id)
}

fn build_manager(
    cfg: &pm_common::AgentConfig,
    data_dir: &std::path::Path,
    agent_id: &str,
    client: Arc<HttpUpdateClient>,
    shared_policy: Arc<SharedPolicy>,
    sink: Arc<ControlChannelSink>,
) -> anyhow::Result<Arc<UpdateManager>> {
    let binary_path = std::env::current_exe()?;

    let manager_cfg = ManagerConfig {
        agent_id: agent_id.to_string(),
        component: "agent".into(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        channel: cfg.channel.clone(),
        current_version: env!("CARGO_PKG_VERSION").to_string(),
        binary_path,
        data_dir: data_dir.to_path_buf(),
        package_name: "printmaster-agent".into(),
        service_name: cfg.service_name.clone(),
        min_disk_space_mb: cfg.min_disk_space_mb,
        max_retries: cfg.max_retries,
        manifest_public_key: cfg.manifest_public_key.clone(),
        msi_mode: update::windows::is_msi_install(),
    };

    Ok(Arc::new(UpdateManager::new(
        manager_cfg,
        client,
        shared_policy,
        sink,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    if command == "version" {
        println!("pm-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = pm_common::AgentConfig::load()?;
    let data_dir = data_dir(&cfg);
    std::fs::create_dir_all(&data_dir)?;

    let agent_id = load_or_create_agent_id(&data_dir)?;
    let http_base = HttpUpdateClient::base_from_ws_url(&cfg.server_url);
    let client = Arc::new(HttpUpdateClient::new(&http_base)?);

    let override_mode: OverrideMode = cfg
        .policy_override
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let local_policy = policy::load_local_policy(&data_dir);
    let shared_policy = Arc::new(SharedPolicy::new(local_policy, override_mode));

    let sink = Arc::new(ControlChannelSink::new(&http_base, &cfg.token)?);
    let manager = build_manager(
        &cfg,
        &data_dir,
        &agent_id,
        client,
        shared_policy.clone(),
        sink.clone(),
    )?;

    if let Some(reason) = manager.disabled_reason() {
        tracing::warn!("Auto-update is disabled on this host: {reason}");
    }

    match command.as_str() {
        "check-now" => {
            let outcome = manager.perform_check().await;
            println!("check result: {outcome:?}");
            Ok(())
        }
        "force-install" => {
            let outcome = manager.force_install_latest().await;
            println!("install result: {outcome:?}");
            Ok(())
        }
        "run" => {
            tracing::info!(%agent_id, "PrintMaster agent starting");

            let scheduler = manager.clone().start();

            let conn = Connection {
                server_url: cfg.server_url.clone(),
                token: cfg.token.clone(),
                agent_id: agent_id.clone(),
                shared_policy,
                writer_slot: sink.writer_slot(),
                manager: manager.clone(),
            };
            let connection_task = tokio::spawn(async move { conn.run().await });

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown signal received");

            manager.stop();
            scheduler.abort();
            connection_task.abort();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            eprintln!("usage: pm-agent [run|check-now|force-install|version]");
            std::process::exit(2);
        }
    }
}
