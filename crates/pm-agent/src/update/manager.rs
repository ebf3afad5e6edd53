//! The update manager: scheduler and state machine driving
//! check → download → verify → stage → backup → apply → restart.
//!
//! Cancellation is cooperative — a latch checked at phase boundaries and
//! inside the download loop. Once Applying starts the latch is ignored;
//! binary swaps and package-manager runs always run to completion.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use uuid::Uuid;

use pm_common::version;
use pm_protocol::{ManifestPayload, SignedManifest, UpdateErrorCode, UpdateReport, UpdateStatus};

use crate::client::{ProgressFn, UpdateClient};
use crate::policy::{self, PolicyProvider};
use crate::telemetry::TelemetrySink;
use crate::update::package_manager::{self, InstallMode};
use crate::update::{apply, download, windows, StateDirs, UpdateRun};

/// Fixed identity and tuning for one manager instance.
pub struct ManagerConfig {
    pub agent_id: String,
    pub component: String,
    pub platform: String,
    pub arch: String,
    pub channel: String,
    pub current_version: String,
    pub binary_path: std::path::PathBuf,
    pub data_dir: std::path::PathBuf,
    /// OS package name used for apt/dnf/yum delegation.
    pub package_name: String,
    /// Service unit name when running under a supervisor.
    pub service_name: Option<String>,
    pub min_disk_space_mb: u64,
    pub max_retries: u32,
    /// Pinned manifest verification key (base64). Verification is skipped
    /// when unset.
    pub manifest_public_key: Option<String>,
    /// Windows MSI install detected at startup.
    pub msi_mode: bool,
}

impl ManagerConfig {
    fn ext(&self) -> &'static str {
        if self.platform == "windows" {
            if self.msi_mode {
                ".msi"
            } else {
                ".exe"
            }
        } else {
            ""
        }
    }
}

/// Outcome of one check pass, for callers that surface it (CLI, logs).
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Busy,
    Disabled(String),
    OutsideWindow,
    PolicyDisabled,
    UpToDate,
    Completed(UpdateStatus),
    Failed(UpdateErrorCode),
}

#[derive(Debug, Default)]
struct ManagerState {
    status: Option<UpdateStatus>,
    last_check: Option<DateTime<Utc>>,
    latest_version: Option<String>,
    latest_manifest: Option<(ManifestPayload, String)>,
    run: Option<UpdateRun>,
}

fn default_disk_free(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

type DiskFreeFn = Box<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

pub struct UpdateManager {
    cfg: ManagerConfig,
    dirs: StateDirs,
    client: Arc<dyn UpdateClient>,
    policy: Arc<dyn PolicyProvider>,
    telemetry: Arc<dyn TelemetrySink>,
    install_mode: InstallMode,
    state: RwLock<ManagerState>,
    cancelled: AtomicBool,
    stopped: AtomicBool,
    stop_signal: Notify,
    restart_fn: apply::RestartFn,
    launch_helper_fn: windows::LaunchHelperFn,
    disk_free_fn: DiskFreeFn,
}

impl UpdateManager {
    pub fn new(
        cfg: ManagerConfig,
        client: Arc<dyn UpdateClient>,
        policy: Arc<dyn PolicyProvider>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let dirs = StateDirs::new(&cfg.data_dir);
        let install_mode = package_manager::detect_install_mode(&cfg.binary_path);
        if let InstallMode::Disabled(reason) = &install_mode {
            tracing::warn!("Auto-update disabled: {reason}");
        }

        let service_name = cfg.service_name.clone();
        Self {
            cfg,
            dirs,
            client,
            policy,
            telemetry,
            install_mode,
            state: RwLock::new(ManagerState::default()),
            cancelled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            restart_fn: Box::new(move || {
                apply::restart_via_supervisor(service_name.as_deref())
            }),
            launch_helper_fn: Box::new(|script| windows::launch_helper(script)),
            disk_free_fn: Box::new(default_disk_free),
        }
    }

    // Test seams, per the capability-interface design.

    pub fn with_install_mode(mut self, mode: InstallMode) -> Self {
        self.install_mode = mode;
        self
    }

    pub fn with_restart_fn(mut self, f: apply::RestartFn) -> Self {
        self.restart_fn = f;
        self
    }

    pub fn with_launch_helper_fn(mut self, f: windows::LaunchHelperFn) -> Self {
        self.launch_helper_fn = f;
        self
    }

    pub fn with_disk_free_fn(mut self, f: DiskFreeFn) -> Self {
        self.disk_free_fn = f;
        self
    }

    // ─── Status surface ──────────────────────────────────────

    pub fn status(&self) -> UpdateStatus {
        self.state
            .read()
            .unwrap()
            .status
            .unwrap_or(UpdateStatus::Idle)
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.read().unwrap().last_check
    }

    pub fn latest_version(&self) -> Option<String> {
        self.state.read().unwrap().latest_version.clone()
    }

    /// Last manifest seen by a check: payload plus its download URL.
    pub fn latest_manifest(&self) -> Option<(ManifestPayload, String)> {
        self.state.read().unwrap().latest_manifest.clone()
    }

    pub fn last_run(&self) -> Option<UpdateRun> {
        self.state.read().unwrap().run.clone()
    }

    pub fn disabled_reason(&self) -> Option<String> {
        match &self.install_mode {
            InstallMode::Disabled(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    // ─── Scheduler ───────────────────────────────────────────

    /// Run the periodic check loop until `stop` is called. Interval comes
    /// from policy (`update_check_days`, default 24 h) plus up to 10 %
    /// jitter so a fleet does not thundering-herd the server.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Update scheduler started");
            loop {
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }

                let (spec, _, enabled) = policy::effective_policy(&*self.policy);
                let base_secs = if enabled && spec.update_check_days > 0 {
                    spec.update_check_days as u64 * 24 * 3600
                } else {
                    24 * 3600
                };
                let jitter = rand::thread_rng().gen_range(0..(base_secs / 10).max(1));
                let next = std::time::Duration::from_secs(base_secs + jitter);
                tracing::debug!(secs = next.as_secs(), "Next update check scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(next) => {
                        let outcome = self.perform_check().await;
                        tracing::debug!(?outcome, "Scheduled update check finished");
                    }
                    _ = self.stop_signal.notified() => break,
                }
            }
            tracing::info!("Update scheduler stopped");
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }

    /// Request cancellation. Only honored in Checking, Pending,
    /// Downloading, and Staging; Applying and beyond run to completion.
    pub fn cancel(&self) -> bool {
        let status = self.status();
        match status {
            UpdateStatus::Checking
            | UpdateStatus::Pending
            | UpdateStatus::Downloading
            | UpdateStatus::Staging => {
                self.cancelled.store(true, Ordering::SeqCst);
                tracing::info!(?status, "Update cancellation requested");
                true
            }
            _ => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // ─── Check ───────────────────────────────────────────────

    pub async fn perform_check(&self) -> CheckOutcome {
        if let InstallMode::Disabled(reason) = &self.install_mode {
            return CheckOutcome::Disabled(reason.clone());
        }

        {
            let mut state = self.state.write().unwrap();
            if !matches!(state.status, None | Some(UpdateStatus::Idle)) {
                return CheckOutcome::Busy;
            }
            state.status = Some(UpdateStatus::Checking);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let (spec, source, enabled) = policy::effective_policy(&*self.policy);

        if !policy::is_in_maintenance_window(&spec, Utc::now()) {
            self.set_idle();
            tracing::debug!("Outside maintenance window, skipping check");
            return CheckOutcome::OutsideWindow;
        }
        if !enabled {
            self.set_idle();
            tracing::debug!("Updates disabled by policy");
            return CheckOutcome::PolicyDisabled;
        }

        let manifest = match self
            .client
            .latest_manifest(
                &self.cfg.component,
                &self.cfg.platform,
                &self.cfg.arch,
                &self.cfg.channel,
            )
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Manifest fetch failed: {e}");
                self.report_check_failure(UpdateErrorCode::ServerError, &e.to_string());
                self.set_idle();
                return CheckOutcome::Failed(UpdateErrorCode::ServerError);
            }
        };

        let payload = match self.validate_manifest(&manifest) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Manifest rejected: {e}");
                self.report_check_failure(UpdateErrorCode::ManifestError, &e.to_string());
                self.set_idle();
                return CheckOutcome::Failed(UpdateErrorCode::ManifestError);
            }
        };

        {
            let mut state = self.state.write().unwrap();
            state.last_check = Some(Utc::now());
            state.latest_version = Some(payload.version.clone());
            state.latest_manifest = Some((payload.clone(), manifest.download_url.clone()));
        }

        if !self.is_update_needed(&payload, &spec) {
            self.set_idle();
            return CheckOutcome::UpToDate;
        }

        if let Some(outcome) = self.preflight_disk(&payload, source.as_str()) {
            self.set_idle();
            return outcome;
        }

        {
            let mut state = self.state.write().unwrap();
            state.status = Some(UpdateStatus::Pending);
        }
        let status = self
            .execute_update(&payload, &manifest.download_url, source.as_str())
            .await;
        self.set_idle();
        CheckOutcome::Completed(status)
    }

    /// Manual trigger: install whatever the server currently serves,
    /// bypassing the window, the enable flag, and the version comparison.
    pub async fn force_install_latest(&self) -> CheckOutcome {
        if let InstallMode::Disabled(reason) = &self.install_mode {
            return CheckOutcome::Disabled(reason.clone());
        }

        {
            let mut state = self.state.write().unwrap();
            if !matches!(state.status, None | Some(UpdateStatus::Idle)) {
                return CheckOutcome::Busy;
            }
            state.status = Some(UpdateStatus::Checking);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let (_, source, _) = policy::effective_policy(&*self.policy);

        let manifest = match self
            .client
            .latest_manifest(
                &self.cfg.component,
                &self.cfg.platform,
                &self.cfg.arch,
                &self.cfg.channel,
            )
            .await
        {
            Ok(m) => m,
            Err(e) => {
                self.report_check_failure(UpdateErrorCode::ServerError, &e.to_string());
                self.set_idle();
                return CheckOutcome::Failed(UpdateErrorCode::ServerError);
            }
        };

        let payload = match self.validate_manifest(&manifest) {
            Ok(p) => p,
            Err(e) => {
                self.report_check_failure(UpdateErrorCode::ManifestError, &e.to_string());
                self.set_idle();
                return CheckOutcome::Failed(UpdateErrorCode::ManifestError);
            }
        };

        {
            let mut state = self.state.write().unwrap();
            state.last_check = Some(Utc::now());
            state.latest_version = Some(payload.version.clone());
            state.latest_manifest = Some((payload.clone(), manifest.download_url.clone()));
            state.status = Some(UpdateStatus::Pending);
        }

        let status = self
            .execute_update(&payload, &manifest.download_url, source.as_str())
            .await;
        self.set_idle();
        CheckOutcome::Completed(status)
    }

    fn validate_manifest(&self, manifest: &SignedManifest) -> anyhow::Result<ManifestPayload> {
        if let Some(key_b64) = &self.cfg.manifest_public_key {
            let raw = B64
                .decode(key_b64)
                .map_err(|e| anyhow::anyhow!("bad pinned key: {e}"))?;
            let raw: [u8; 32] = raw
                .try_into()
                .map_err(|_| anyhow::anyhow!("pinned key is not 32 bytes"))?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|e| anyhow::anyhow!("bad pinned key: {e}"))?;

            let sig_raw = B64
                .decode(&manifest.signature)
                .map_err(|e| anyhow::anyhow!("bad signature encoding: {e}"))?;
            let sig_raw: [u8; 64] = sig_raw
                .try_into()
                .map_err(|_| anyhow::anyhow!("signature is not 64 bytes"))?;
            key.verify(manifest.manifest_json.as_bytes(), &Signature::from_bytes(&sig_raw))
                .map_err(|_| anyhow::anyhow!("manifest signature verification failed"))?;
        }

        let payload = manifest
            .payload()
            .map_err(|e| anyhow::anyhow!("unparsable manifest payload: {e}"))?;
        if payload.sha256.len() != 64 || !payload.sha256.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("manifest sha256 is not 64 hex chars");
        }
        if payload.platform != self.cfg.platform || payload.arch != self.cfg.arch {
            anyhow::bail!(
                "manifest targets {}/{}, this host is {}/{}",
                payload.platform,
                payload.arch,
                self.cfg.platform,
                self.cfg.arch
            );
        }
        Ok(payload)
    }

    fn is_update_needed(&self, payload: &ManifestPayload, spec: &pm_protocol::PolicySpec) -> bool {
        let target = payload.version.as_str();
        let current = self.cfg.current_version.as_str();
        if target.is_empty() || target == current {
            return false;
        }
        if !policy::is_version_allowed(current, target, spec) {
            tracing::info!(%current, %target, "Update available but blocked by version pin policy");
            return false;
        }
        version::is_newer(target, current)
    }

    /// Require room for download + staging + backup. A failing space query
    /// is non-blocking; insufficient space fails the run without disabling
    /// the manager.
    fn preflight_disk(&self, payload: &ManifestPayload, source: &str) -> Option<CheckOutcome> {
        let floor = self.cfg.min_disk_space_mb * 1024 * 1024;
        let required = (payload.size_bytes.max(0) as u64)
            .saturating_mul(3)
            .max(floor);

        match (self.disk_free_fn)(&self.cfg.data_dir) {
            Some(free) if free < required => {
                tracing::warn!(free, required, "Insufficient disk space for update");
                let mut run = self.new_run(payload, source);
                run.fail(
                    UpdateErrorCode::DiskSpace,
                    format!("need {required} bytes free, have {free}"),
                );
                self.report_run(&run, None);
                self.state.write().unwrap().run = Some(run);
                Some(CheckOutcome::Failed(UpdateErrorCode::DiskSpace))
            }
            Some(_) => None,
            None => {
                tracing::debug!("Disk space query failed, proceeding anyway");
                None
            }
        }
    }

    // ─── Execute ─────────────────────────────────────────────

    fn new_run(&self, payload: &ManifestPayload, source: &str) -> UpdateRun {
        UpdateRun::new(
            &self.cfg.current_version,
            &payload.version,
            &payload.channel,
            &self.cfg.platform,
            &self.cfg.arch,
            payload.size_bytes,
            source,
        )
    }

    async fn execute_update(
        &self,
        payload: &ManifestPayload,
        download_url: &str,
        policy_source: &str,
    ) -> UpdateStatus {
        let mut run = self.new_run(payload, policy_source);
        run.started_at = Some(Utc::now());
        self.transition(&mut run, UpdateStatus::Pending, None);

        if let Err(e) = self.dirs.ensure() {
            run.fail(UpdateErrorCode::StagingFailed, format!("state dir: {e}"));
            self.finish(run.clone());
            return UpdateStatus::Failed;
        }

        let status = match &self.install_mode {
            InstallMode::Package(kind) => self.execute_package_update(&mut run, *kind).await,
            InstallMode::Binary => self.execute_binary_update(&mut run, payload, download_url).await,
            InstallMode::Disabled(reason) => {
                run.status = UpdateStatus::Skipped;
                run.error_message = Some(reason.clone());
                run.completed_at = Some(Utc::now());
                UpdateStatus::Skipped
            }
        };

        self.finish(run);
        status
    }

    /// Package-managed hosts skip download/hash/stage entirely; the
    /// package manager owns fetch and verification.
    async fn execute_package_update(
        &self,
        run: &mut UpdateRun,
        kind: package_manager::PackageManagerKind,
    ) -> UpdateStatus {
        if self.is_cancelled() {
            return self.cancel_run(run);
        }

        self.transition(run, UpdateStatus::Applying, None);

        let sink = Arc::clone(&self.telemetry);
        let template = self.run_report(run, None);
        let progress = move |percent: u8| {
            let mut report = template.clone();
            report.timestamp = Utc::now();
            report.metadata = Some(serde_json::json!({ "percent": percent }));
            sink.report(report);
        };

        if let Err(e) = package_manager::apply_package_update(
            kind,
            &self.cfg.package_name,
            &run.target_version,
            &progress,
        )
        .await
        {
            run.fail(UpdateErrorCode::ApplyFailed, e.to_string());
            return UpdateStatus::Failed;
        }

        self.restart_phase(run)
    }

    async fn execute_binary_update(
        &self,
        run: &mut UpdateRun,
        payload: &ManifestPayload,
        download_url: &str,
    ) -> UpdateStatus {
        let ext = self.cfg.ext();
        let dest = self
            .dirs
            .download_path(&payload.version, &self.cfg.platform, &self.cfg.arch, ext);

        // ── Downloading ──────────────────────────────────────
        if self.is_cancelled() {
            return self.cancel_run(run);
        }
        self.transition(
            run,
            UpdateStatus::Downloading,
            Some(serde_json::json!({ "percent": 0 })),
        );

        let progress = self.download_progress(run);
        let started = Instant::now();
        match download::download_with_retries(
            &*self.client,
            download_url,
            &dest,
            payload.size_bytes.max(0) as u64,
            self.cfg.max_retries,
            Some(progress),
            &self.cancelled,
        )
        .await
        {
            Ok(size) => {
                run.size_bytes = size as i64;
                run.download_time_ms = Some(started.elapsed().as_millis() as i64);
                run.downloaded_at = Some(Utc::now());
            }
            Err(e) => {
                if self.is_cancelled() {
                    return self.cancel_run(run);
                }
                // The partial stays on disk for the next run to resume.
                run.fail(UpdateErrorCode::DownloadFailed, e.to_string());
                return UpdateStatus::Failed;
            }
        }

        if self.is_cancelled() {
            return self.cancel_run(run);
        }

        // ── Hash verification ────────────────────────────────
        match tokio::fs::read(&dest).await {
            Ok(bytes) => {
                let actual = hex::encode(Sha256::digest(&bytes));
                if !actual.eq_ignore_ascii_case(&payload.sha256) {
                    let _ = tokio::fs::remove_file(&dest).await;
                    run.fail(
                        UpdateErrorCode::HashMismatch,
                        format!("expected {}, got {actual}", payload.sha256),
                    );
                    return UpdateStatus::Failed;
                }
            }
            Err(e) => {
                run.fail(UpdateErrorCode::DownloadFailed, format!("read downloaded file: {e}"));
                return UpdateStatus::Failed;
            }
        }

        if self.is_cancelled() {
            return self.cancel_run(run);
        }

        // ── Staging ──────────────────────────────────────────
        self.transition(run, UpdateStatus::Staging, None);
        let staging = self
            .dirs
            .staging_path(&payload.version, &self.cfg.platform, &self.cfg.arch, ext);
        if let Err(e) = tokio::fs::copy(&dest, &staging).await {
            run.fail(UpdateErrorCode::StagingFailed, e.to_string());
            return UpdateStatus::Failed;
        }

        // Last cancellable point.
        if self.is_cancelled() {
            return self.cancel_run(run);
        }

        // ── Backup (warn-only) ───────────────────────────────
        let backup = self.dirs.backup_path(
            &self.cfg.current_version,
            &self.cfg.platform,
            &self.cfg.arch,
            ext,
        );
        let backup_ok = match apply::backup_current(&self.cfg.binary_path, &backup) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Backup failed, rollback will be unavailable: {e}");
                false
            }
        };

        // ── Applying ─────────────────────────────────────────
        self.transition(run, UpdateStatus::Applying, None);
        let apply_result = if self.cfg.platform == "windows" {
            self.apply_windows(&staging)
        } else {
            apply::install_staged(&staging, &self.cfg.binary_path)
        };

        if let Err(e) = apply_result {
            run.fail(UpdateErrorCode::ApplyFailed, e.to_string());
            if backup_ok {
                match apply::rollback(&backup, &self.cfg.binary_path) {
                    Ok(()) => {
                        run.status = UpdateStatus::RolledBack;
                        return UpdateStatus::RolledBack;
                    }
                    Err(rb) => {
                        // Never masks the apply error.
                        tracing::error!("Rollback failed: {rb}");
                        run.error_message = Some(format!(
                            "{e}; rollback also failed: {rb}"
                        ));
                    }
                }
            } else {
                tracing::error!("No backup available, cannot roll back");
            }
            return UpdateStatus::Failed;
        }

        self.restart_phase(run)
    }

    /// Windows cannot overwrite a running exe: write the right helper
    /// script into the state dir and launch it detached. The agent exits
    /// from the restart step; the helper finishes the swap.
    fn apply_windows(&self, staging: &Path) -> anyhow::Result<()> {
        let (name, script) = if self.cfg.msi_mode {
            let log = self.dirs.root.join(windows::MSI_LOG_NAME);
            (
                windows::MSI_HELPER_NAME,
                windows::msi_update_script(staging, &log)?,
            )
        } else if let Some(service) = &self.cfg.service_name {
            (
                windows::UPDATE_HELPER_NAME,
                windows::service_update_script(staging, &self.cfg.binary_path, service)?,
            )
        } else {
            (
                windows::UPDATE_HELPER_NAME,
                windows::standalone_update_script(staging, &self.cfg.binary_path)?,
            )
        };

        let path = windows::write_helper(&self.dirs.root, name, &script)?;
        (self.launch_helper_fn)(&path)
    }

    /// Restart is reported before the hook runs — the default hook exits
    /// the process.
    fn restart_phase(&self, run: &mut UpdateRun) -> UpdateStatus {
        self.transition(run, UpdateStatus::Restarting, None);

        if let Err(e) = (self.restart_fn)() {
            run.fail(UpdateErrorCode::RestartFailed, e.to_string());
            return UpdateStatus::Failed;
        }

        run.status = UpdateStatus::Succeeded;
        run.completed_at = Some(Utc::now());
        UpdateStatus::Succeeded
    }

    // ─── Run bookkeeping ─────────────────────────────────────

    fn cancel_run(&self, run: &mut UpdateRun) -> UpdateStatus {
        run.status = UpdateStatus::Cancelled;
        run.completed_at = Some(Utc::now());
        tracing::info!(run_id = %run.id, "Update run cancelled");
        UpdateStatus::Cancelled
    }

    fn transition(&self, run: &mut UpdateRun, status: UpdateStatus, metadata: Option<serde_json::Value>) {
        run.status = status;
        {
            let mut state = self.state.write().unwrap();
            state.status = Some(status);
            state.run = Some(run.clone());
        }
        self.report_run(run, metadata);
    }

    /// Terminal bookkeeping: persist the run snapshot and report it.
    fn finish(&self, run: UpdateRun) {
        self.report_run(&run, None);
        let mut state = self.state.write().unwrap();
        state.status = Some(run.status);
        state.run = Some(run);
    }

    fn set_idle(&self) {
        self.state.write().unwrap().status = Some(UpdateStatus::Idle);
    }

    fn run_report(&self, run: &UpdateRun, metadata: Option<serde_json::Value>) -> UpdateReport {
        UpdateReport {
            agent_id: self.cfg.agent_id.clone(),
            run_id: run.id.clone(),
            status: run.status,
            current_version: run.current_version.clone(),
            target_version: Some(run.target_version.clone()),
            size_bytes: Some(run.size_bytes),
            download_time_ms: run.download_time_ms,
            timestamp: Utc::now(),
            error_code: run.error_code,
            error_message: run.error_message.clone(),
            metadata,
        }
    }

    fn report_run(&self, run: &UpdateRun, metadata: Option<serde_json::Value>) {
        self.telemetry.report(self.run_report(run, metadata));
    }

    /// Check-phase failures have no run yet; report with a fresh id.
    fn report_check_failure(&self, code: UpdateErrorCode, message: &str) {
        self.telemetry.report(UpdateReport {
            agent_id: self.cfg.agent_id.clone(),
            run_id: Uuid::new_v4().to_string(),
            status: UpdateStatus::Failed,
            current_version: self.cfg.current_version.clone(),
            target_version: None,
            size_bytes: None,
            download_time_ms: None,
            timestamp: Utc::now(),
            error_code: Some(code),
            error_message: Some(message.to_string()),
            metadata: None,
        });
    }

    /// Byte-progress → throttled telemetry (every 10 %, plus completion).
    fn download_progress(&self, run: &UpdateRun) -> ProgressFn {
        let sink = Arc::clone(&self.telemetry);
        let template = self.run_report(run, None);
        let last_percent = Arc::new(AtomicU64::new(u64::MAX));

        Arc::new(move |done, total| {
            let percent = if total > 0 { done * 100 / total } else { 0 };
            let prev = last_percent.load(Ordering::Relaxed);
            if prev != u64::MAX && percent < prev.saturating_add(10) && percent != 100 {
                return;
            }
            last_percent.store(percent, Ordering::Relaxed);

            let mut report = template.clone();
            report.timestamp = Utc::now();
            report.metadata = Some(serde_json::json!({
                "percent": percent,
                "downloaded": done,
                "total": total,
            }));
            sink.report(report);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use pm_protocol::{PinStrategy, PolicySpec, MANIFEST_VERSION};

    use super::*;
    use crate::policy::OverrideMode;

    // ── Test doubles ─────────────────────────────────────────

    struct RecordingSink {
        reports: Mutex<Vec<UpdateReport>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reports: Mutex::new(Vec::new()),
            })
        }

        fn codes(&self) -> Vec<Option<UpdateErrorCode>> {
            self.reports.lock().unwrap().iter().map(|r| r.error_code).collect()
        }

        fn statuses(&self) -> Vec<UpdateStatus> {
            self.reports.lock().unwrap().iter().map(|r| r.status).collect()
        }
    }

    impl TelemetrySink for RecordingSink {
        fn report(&self, report: UpdateReport) {
            self.reports.lock().unwrap().push(report);
        }
    }

    struct FixedPolicy {
        fleet: Option<PolicySpec>,
        local: PolicySpec,
        mode: OverrideMode,
    }

    impl FixedPolicy {
        fn enabled() -> Arc<Self> {
            Arc::new(Self {
                fleet: None,
                local: PolicySpec {
                    update_check_days: 1,
                    ..Default::default()
                },
                mode: OverrideMode::Inherit,
            })
        }

        fn with_local(local: PolicySpec) -> Arc<Self> {
            Arc::new(Self {
                fleet: None,
                local,
                mode: OverrideMode::Inherit,
            })
        }
    }

    impl PolicyProvider for FixedPolicy {
        fn fleet_policy(&self) -> Option<PolicySpec> {
            self.fleet.clone()
        }
        fn local_policy(&self) -> PolicySpec {
            self.local.clone()
        }
        fn override_mode(&self) -> OverrideMode {
            self.mode
        }
    }

    struct MockClient {
        manifest: Mutex<Option<SignedManifest>>,
        payload: Vec<u8>,
        manifest_calls: AtomicU32,
        download_calls: AtomicU32,
        block_until_cancelled: bool,
    }

    impl MockClient {
        fn new(manifest: SignedManifest, payload: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                manifest: Mutex::new(Some(manifest)),
                payload,
                manifest_calls: AtomicU32::new(0),
                download_calls: AtomicU32::new(0),
                block_until_cancelled: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                manifest: Mutex::new(None),
                payload: Vec::new(),
                manifest_calls: AtomicU32::new(0),
                download_calls: AtomicU32::new(0),
                block_until_cancelled: false,
            })
        }
    }

    #[async_trait]
    impl UpdateClient for MockClient {
        async fn latest_manifest(
            &self,
            _component: &str,
            _platform: &str,
            _arch: &str,
            _channel: &str,
        ) -> anyhow::Result<SignedManifest> {
            self.manifest_calls.fetch_add(1, Ordering::SeqCst);
            self.manifest
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| anyhow::anyhow!("HTTP 500"))
        }

        async fn download(
            &self,
            _url: &str,
            dest: &Path,
            resume_from: u64,
            _expected_total: u64,
            _progress: Option<ProgressFn>,
            cancelled: &AtomicBool,
        ) -> anyhow::Result<u64> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);

            if self.block_until_cancelled {
                for _ in 0..500 {
                    if cancelled.load(Ordering::SeqCst) {
                        anyhow::bail!("download cancelled");
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                anyhow::bail!("mock never cancelled");
            }

            let remaining = &self.payload[resume_from as usize..];
            let mut existing = if resume_from > 0 {
                tokio::fs::read(dest).await.unwrap_or_default()
            } else {
                Vec::new()
            };
            existing.extend_from_slice(remaining);
            tokio::fs::write(dest, &existing).await?;
            Ok(remaining.len() as u64)
        }
    }

    // ── Fixtures ─────────────────────────────────────────────

    const PAYLOAD: &[u8] = b"new-agent-binary";

    fn payload_sha() -> String {
        hex::encode(Sha256::digest(PAYLOAD))
    }

    fn make_manifest(version: &str, platform: &str, sha256: &str) -> SignedManifest {
        let payload = ManifestPayload {
            manifest_version: MANIFEST_VERSION,
            component: "agent".into(),
            version: version.into(),
            minor_line: pm_common::version::minor_line(version),
            platform: platform.into(),
            arch: "x86_64".into(),
            channel: "stable".into(),
            sha256: sha256.into(),
            size_bytes: PAYLOAD.len() as i64,
            source_url: "https://up.example/agent".into(),
            published_at: Utc::now(),
            generated_at: Utc::now(),
        };
        SignedManifest {
            manifest_json: String::from_utf8(payload.canonical_json().unwrap()).unwrap(),
            signature: String::new(),
            signing_key_id: "k1".into(),
            download_url: "/api/artifacts/printmaster-agent".into(),
        }
    }

    struct Fixture {
        manager: Arc<UpdateManager>,
        sink: Arc<RecordingSink>,
        client: Arc<MockClient>,
        restart_called: Arc<AtomicBool>,
        helper_launched: Arc<AtomicBool>,
        binary: std::path::PathBuf,
        data_dir: tempfile::TempDir,
    }

    fn fixture_with(
        client: Arc<MockClient>,
        policy: Arc<dyn PolicyProvider>,
        platform: &str,
        current_version: &str,
    ) -> Fixture {
        let data_dir = tempfile::tempdir().unwrap();
        let binary = data_dir.path().join("pm-agent");
        std::fs::write(&binary, b"old-agent-binary").unwrap();

        let sink = RecordingSink::new();
        let restart_called = Arc::new(AtomicBool::new(false));
        let helper_launched = Arc::new(AtomicBool::new(false));

        let cfg = ManagerConfig {
            agent_id: "a-1".into(),
            component: "agent".into(),
            platform: platform.into(),
            arch: "x86_64".into(),
            channel: "stable".into(),
            current_version: current_version.into(),
            binary_path: binary.clone(),
            data_dir: data_dir.path().to_path_buf(),
            package_name: "printmaster-agent".into(),
            service_name: None,
            min_disk_space_mb: 200,
            max_retries: 2,
            manifest_public_key: None,
            msi_mode: false,
        };

        let restart_flag = Arc::clone(&restart_called);
        let launch_flag = Arc::clone(&helper_launched);
        let manager = UpdateManager::new(
            cfg,
            client.clone(),
            policy,
            sink.clone(),
        )
        .with_install_mode(InstallMode::Binary)
        .with_disk_free_fn(Box::new(|_| Some(u64::MAX)))
        .with_restart_fn(Box::new(move || {
            restart_flag.store(true, Ordering::SeqCst);
            Ok(())
        }))
        .with_launch_helper_fn(Box::new(move |_script| {
            launch_flag.store(true, Ordering::SeqCst);
            Ok(())
        }));

        Fixture {
            manager: Arc::new(manager),
            sink,
            client,
            restart_called,
            helper_launched,
            binary,
            data_dir,
        }
    }

    // ── Scenarios ────────────────────────────────────────────

    #[tokio::test]
    async fn force_install_replaces_binary_end_to_end() {
        let client = MockClient::new(
            make_manifest("1.0.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");

        let outcome = fx.manager.force_install_latest().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Succeeded));

        assert_eq!(std::fs::read(&fx.binary).unwrap(), PAYLOAD);
        assert!(fx.restart_called.load(Ordering::SeqCst));

        let run = fx.manager.last_run().unwrap();
        assert_eq!(run.status, UpdateStatus::Succeeded);
        assert!(run.error_code.is_none());
        assert!(run.download_time_ms.is_some());
        assert_eq!(run.size_bytes, PAYLOAD.len() as i64);

        // A backup of the old binary exists.
        let backup = StateDirs::new(fx.data_dir.path())
            .backup_path("1.0.0", "linux", "x86_64", "");
        assert_eq!(std::fs::read(backup).unwrap(), b"old-agent-binary");

        // Phases were reported in order, ending in success.
        let statuses = fx.sink.statuses();
        assert_eq!(statuses.first(), Some(&UpdateStatus::Pending));
        assert_eq!(statuses.last(), Some(&UpdateStatus::Succeeded));
        assert!(statuses.contains(&UpdateStatus::Downloading));
        assert!(statuses.contains(&UpdateStatus::Staging));
        assert!(statuses.contains(&UpdateStatus::Restarting));
    }

    #[tokio::test]
    async fn windows_apply_writes_helper_script() {
        let client = MockClient::new(
            make_manifest("2.0.0", "windows", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, FixedPolicy::enabled(), "windows", "1.0.0");

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Succeeded));

        let helper = fx.data_dir.path().join("autoupdate").join(windows::UPDATE_HELPER_NAME);
        assert!(helper.exists());
        let script = std::fs::read_to_string(&helper).unwrap();
        assert!(script.contains("copy /y"));
        assert!(fx.helper_launched.load(Ordering::SeqCst));
        // The helper does the swap after we exit; the binary is untouched
        // at this point.
        assert_eq!(std::fs::read(&fx.binary).unwrap(), b"old-agent-binary");
        assert!(fx.restart_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn hash_mismatch_fails_and_removes_the_file() {
        let wrong_sha = "0".repeat(64);
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &wrong_sha),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Failed));

        let run = fx.manager.last_run().unwrap();
        assert_eq!(run.error_code, Some(UpdateErrorCode::HashMismatch));

        // The corrupt download is gone; the binary is untouched.
        let dest = StateDirs::new(fx.data_dir.path())
            .download_path("1.1.0", "linux", "x86_64", "");
        assert!(!dest.exists());
        assert_eq!(std::fs::read(&fx.binary).unwrap(), b"old-agent-binary");
    }

    #[tokio::test]
    async fn major_pin_blocks_the_jump() {
        let client = MockClient::new(
            make_manifest("2.0.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let policy = FixedPolicy::with_local(PolicySpec {
            update_check_days: 1,
            version_pin_strategy: PinStrategy::Major,
            allow_major_upgrade: false,
            ..Default::default()
        });
        let fx = fixture_with(client, policy, "linux", "1.9.0");

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::UpToDate);
        assert_eq!(fx.client.download_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.manager.status(), UpdateStatus::Idle);
    }

    #[tokio::test]
    async fn closed_window_skips_without_touching_the_server() {
        let policy = FixedPolicy::with_local(PolicySpec {
            update_check_days: 1,
            maintenance_window: Some(pm_protocol::MaintenanceWindow {
                enabled: true,
                timezone: "UTC".into(),
                days_of_week: Default::default(),
                // Zero-length window: never open.
                start_hour: 0,
                start_min: 0,
                end_hour: 0,
                end_min: 0,
            }),
            ..Default::default()
        });
        let client = MockClient::new(
            make_manifest("9.9.9", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, policy, "linux", "1.0.0");

        assert_eq!(fx.manager.perform_check().await, CheckOutcome::OutsideWindow);
        assert_eq!(fx.client.manifest_calls.load(Ordering::SeqCst), 0);
        assert!(fx.sink.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_policy_is_silent() {
        let policy = FixedPolicy::with_local(PolicySpec::default());
        let client = MockClient::new(
            make_manifest("9.9.9", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, policy, "linux", "1.0.0");

        assert_eq!(fx.manager.perform_check().await, CheckOutcome::PolicyDisabled);
        assert!(fx.sink.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manifest_fetch_failure_reports_server_error() {
        let fx = fixture_with(MockClient::failing(), FixedPolicy::enabled(), "linux", "1.0.0");

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Failed(UpdateErrorCode::ServerError));
        assert_eq!(fx.sink.codes(), vec![Some(UpdateErrorCode::ServerError)]);
        assert_eq!(fx.manager.status(), UpdateStatus::Idle);
    }

    #[tokio::test]
    async fn insufficient_disk_space_fails_without_downloading() {
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let mut fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        {
            let manager = Arc::get_mut(&mut fx.manager).unwrap();
            manager.disk_free_fn = Box::new(|_| Some(1024));
        }

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Failed(UpdateErrorCode::DiskSpace));
        assert_eq!(fx.client.download_calls.load(Ordering::SeqCst), 0);
        let run = fx.manager.last_run().unwrap();
        assert_eq!(run.error_code, Some(UpdateErrorCode::DiskSpace));
        // The manager is not disabled; a later check runs again.
        assert_eq!(fx.manager.status(), UpdateStatus::Idle);
    }

    #[tokio::test]
    async fn disk_space_query_failure_is_non_blocking() {
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let mut fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        {
            let manager = Arc::get_mut(&mut fx.manager).unwrap();
            manager.disk_free_fn = Box::new(|_| None);
        }

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Succeeded));
    }

    #[tokio::test]
    async fn cancel_mid_download_is_honored() {
        let mut client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        Arc::get_mut(&mut client).unwrap().block_until_cancelled = true;
        let fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");

        let manager = Arc::clone(&fx.manager);
        let handle = tokio::spawn(async move { manager.perform_check().await });

        // Wait until the run is in the Downloading phase.
        for _ in 0..100 {
            if fx.manager.status() == UpdateStatus::Downloading {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(fx.manager.status(), UpdateStatus::Downloading);
        assert!(fx.manager.cancel());

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Cancelled));
        assert_eq!(fx.manager.last_run().unwrap().status, UpdateStatus::Cancelled);
        assert!(!fx.restart_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_outside_cancellable_states_is_refused() {
        let client = MockClient::new(
            make_manifest("1.0.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        // Idle.
        assert!(!fx.manager.cancel());
    }

    #[tokio::test]
    async fn pinned_key_rejects_bad_signature_and_accepts_good() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let public_b64 = B64.encode(signing.verifying_key().to_bytes());

        let mut manifest = make_manifest("1.1.0", "linux", &payload_sha());
        manifest.signature = B64.encode([0u8; 64]);

        let client = MockClient::new(manifest.clone(), PAYLOAD.to_vec());
        let mut fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        // Pin the key.
        {
            let manager = Arc::get_mut(&mut fx.manager).unwrap();
            manager.cfg.manifest_public_key = Some(public_b64.clone());
        }

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Failed(UpdateErrorCode::ManifestError));

        // Now with a valid signature over the exact payload bytes.
        let mut good = manifest.clone();
        good.signature = B64.encode(signing.sign(good.manifest_json.as_bytes()).to_bytes());
        *fx.client.manifest.lock().unwrap() = Some(good);

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Succeeded));
    }

    #[tokio::test]
    async fn disabled_install_mode_short_circuits() {
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let data_dir = tempfile::tempdir().unwrap();
        let binary = data_dir.path().join("pm-agent");
        std::fs::write(&binary, b"old").unwrap();
        let manager = UpdateManager::new(
            ManagerConfig {
                agent_id: "a-1".into(),
                component: "agent".into(),
                platform: "linux".into(),
                arch: "x86_64".into(),
                channel: "stable".into(),
                current_version: "1.0.0".into(),
                binary_path: binary,
                data_dir: data_dir.path().to_path_buf(),
                package_name: "printmaster-agent".into(),
                service_name: None,
                min_disk_space_mb: 200,
                max_retries: 1,
                manifest_public_key: None,
                msi_mode: false,
            },
            client.clone(),
            FixedPolicy::enabled(),
            RecordingSink::new(),
        )
        .with_install_mode(InstallMode::Disabled("read-only install".into()));

        match manager.perform_check().await {
            CheckOutcome::Disabled(reason) => assert!(reason.contains("read-only")),
            other => panic!("expected Disabled, got {other:?}"),
        }
        assert_eq!(client.manifest_calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.disabled_reason().as_deref(), Some("read-only install"));
    }

    #[tokio::test]
    async fn failed_apply_without_backup_reports_apply_failed() {
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        // Pointing binary_path at a directory makes both the backup copy
        // and the rename fail.
        let mut fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        {
            let dir_as_binary = fx.data_dir.path().join("not-a-file");
            std::fs::create_dir(&dir_as_binary).unwrap();
            let manager = Arc::get_mut(&mut fx.manager).unwrap();
            manager.cfg.binary_path = dir_as_binary;
        }

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Failed));
        let run = fx.manager.last_run().unwrap();
        assert_eq!(run.error_code, Some(UpdateErrorCode::ApplyFailed));
        assert!(!fx.restart_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_restart_reports_restart_failed() {
        let client = MockClient::new(
            make_manifest("1.1.0", "linux", &payload_sha()),
            PAYLOAD.to_vec(),
        );
        let mut fx = fixture_with(client, FixedPolicy::enabled(), "linux", "1.0.0");
        {
            let manager = Arc::get_mut(&mut fx.manager).unwrap();
            manager.restart_fn = Box::new(|| anyhow::bail!("service manager unavailable"));
        }

        let outcome = fx.manager.perform_check().await;
        assert_eq!(outcome, CheckOutcome::Completed(UpdateStatus::Failed));
        let run = fx.manager.last_run().unwrap();
        assert_eq!(run.error_code, Some(UpdateErrorCode::RestartFailed));
        // The binary was still swapped before the restart failed.
        assert_eq!(std::fs::read(&fx.binary).unwrap(), PAYLOAD);
    }
}
