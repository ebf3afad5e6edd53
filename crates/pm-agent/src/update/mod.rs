//! Self-update pipeline: scheduler + state machine, resumable download,
//! platform apply strategies, and rollback.

pub mod apply;
pub mod download;
pub mod manager;
pub mod package_manager;
pub mod windows;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use pm_protocol::{UpdateErrorCode, UpdateStatus};

/// Layout of the agent's update state directory:
/// `<data>/autoupdate/{downloads, staging, backups}`.
#[derive(Debug, Clone)]
pub struct StateDirs {
    pub root: PathBuf,
    pub downloads: PathBuf,
    pub staging: PathBuf,
    pub backups: PathBuf,
}

impl StateDirs {
    pub fn new(data_dir: &Path) -> Self {
        let root = data_dir.join("autoupdate");
        Self {
            downloads: root.join("downloads"),
            staging: root.join("staging"),
            backups: root.join("backups"),
            root,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.root, &self.downloads, &self.staging, &self.backups] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Download destination for one artifact:
    /// `downloads/agent-<version>-<platform>-<arch><ext>`.
    pub fn download_path(&self, version: &str, platform: &str, arch: &str, ext: &str) -> PathBuf {
        self.downloads
            .join(format!("agent-{version}-{platform}-{arch}{ext}"))
    }

    pub fn staging_path(&self, version: &str, platform: &str, arch: &str, ext: &str) -> PathBuf {
        self.staging
            .join(format!("agent-{version}-{platform}-{arch}{ext}"))
    }

    /// Backup location for the currently running binary.
    pub fn backup_path(&self, current_version: &str, platform: &str, arch: &str, ext: &str) -> PathBuf {
        self.backups
            .join(format!("agent-{current_version}-{platform}-{arch}{ext}"))
    }
}

/// Record of one update attempt. Owned and mutated only by the manager.
#[derive(Debug, Clone)]
pub struct UpdateRun {
    pub id: String,
    pub status: UpdateStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_version: String,
    pub target_version: String,
    pub channel: String,
    pub platform: String,
    pub arch: String,
    pub size_bytes: i64,
    pub download_time_ms: Option<i64>,
    pub error_code: Option<UpdateErrorCode>,
    pub error_message: Option<String>,
    pub policy_source: String,
}

impl UpdateRun {
    pub fn new(
        current_version: &str,
        target_version: &str,
        channel: &str,
        platform: &str,
        arch: &str,
        size_bytes: i64,
        policy_source: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: UpdateStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            downloaded_at: None,
            completed_at: None,
            current_version: current_version.to_string(),
            target_version: target_version.to_string(),
            channel: channel.to_string(),
            platform: platform.to_string(),
            arch: arch.to_string(),
            size_bytes,
            download_time_ms: None,
            error_code: None,
            error_message: None,
            policy_source: policy_source.to_string(),
        }
    }

    pub fn fail(&mut self, code: UpdateErrorCode, message: impl Into<String>) {
        self.status = UpdateStatus::Failed;
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_layout() {
        let dirs = StateDirs::new(Path::new("/var/lib/printmaster"));
        assert_eq!(dirs.root, Path::new("/var/lib/printmaster/autoupdate"));
        assert_eq!(
            dirs.download_path("1.2.3", "linux", "x86_64", ""),
            Path::new("/var/lib/printmaster/autoupdate/downloads/agent-1.2.3-linux-x86_64")
        );
        assert_eq!(
            dirs.download_path("1.2.3", "windows", "x86_64", ".exe"),
            Path::new("/var/lib/printmaster/autoupdate/downloads/agent-1.2.3-windows-x86_64.exe")
        );
        assert_eq!(
            dirs.backup_path("1.0.0", "linux", "x86_64", ""),
            Path::new("/var/lib/printmaster/autoupdate/backups/agent-1.0.0-linux-x86_64")
        );
    }
}
