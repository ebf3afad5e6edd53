//! Release intake worker — polls the upstream feed on a fixed period with
//! an immediate first pass. A failed pass is logged and retried next tick.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::services::intake::{IntakeConfig, ReleaseIntake};
use crate::services::release_source::GithubReleaseSource;
use crate::AppState;

pub fn start(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cfg = &state.config.releases;

        let source = match GithubReleaseSource::new(&cfg.repo) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Release intake disabled — cannot build HTTP client: {e}");
                return;
            }
        };

        let intake = ReleaseIntake::new(
            source,
            state.artifacts.clone(),
            state.manifests.clone(),
            state.signer.clone(),
            IntakeConfig {
                cache_dir: cfg.cache_dir.clone().into(),
                max_releases: cfg.max_releases,
                channel: "stable".into(),
            },
        );

        let period = tokio::time::Duration::from_secs(cfg.poll_interval_secs.max(60));
        let mut interval = tokio::time::interval(period);

        tracing::info!(
            repo = %cfg.repo,
            period_secs = period.as_secs(),
            "Release intake worker started"
        );

        loop {
            // First tick fires immediately.
            interval.tick().await;
            if let Err(e) = intake.run_pass().await {
                tracing::error!("Release intake pass failed: {e}");
            }
        }
    })
}
