//! Binary apply strategies for Unix hosts, rollback, and the restart hook.
//!
//! Same-filesystem installs are an atomic rename. A cross-device rename
//! error falls back to copy + chmod; a read-only filesystem gets a help
//! message pointing at the package-manager procedure instead of a raw errno.

use std::io;
use std::path::Path;

/// `EXDEV` — rename across filesystems.
const CROSS_DEVICE: i32 = 18;
/// `EROFS` — read-only filesystem.
const READ_ONLY_FS: i32 = 30;

pub const READ_ONLY_HELP: &str = "the agent binary sits on a read-only filesystem; \
install updates through your OS package manager (apt/dnf/yum) instead of the built-in updater";

/// Replace `binary_path` with the staged binary.
pub fn install_staged(staging: &Path, binary_path: &Path) -> anyhow::Result<()> {
    set_executable(staging)?;

    match std::fs::rename(staging, binary_path) {
        Ok(()) => {
            tracing::info!("Installed update via rename to {}", binary_path.display());
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE) => {
            tracing::debug!("Staging dir is on another filesystem, copying instead");
            copy_install(staging, binary_path)
        }
        Err(e) => Err(anyhow::anyhow!(
            "rename {} -> {} failed: {e}",
            staging.display(),
            binary_path.display()
        )),
    }
}

fn copy_install(staging: &Path, binary_path: &Path) -> anyhow::Result<()> {
    match std::fs::copy(staging, binary_path) {
        Ok(_) => {}
        Err(e) if e.raw_os_error() == Some(READ_ONLY_FS) => {
            anyhow::bail!("{READ_ONLY_HELP}");
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "copy {} -> {} failed: {e}",
                staging.display(),
                binary_path.display()
            ))
        }
    }

    set_executable(binary_path)?;
    if let Err(e) = std::fs::remove_file(staging) {
        tracing::debug!("Staging cleanup failed: {e}");
    }
    tracing::info!("Installed update via copy to {}", binary_path.display());
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Copy the running binary aside before apply. Warn-only at the call site.
pub fn backup_current(binary_path: &Path, backup_path: &Path) -> anyhow::Result<()> {
    std::fs::copy(binary_path, backup_path).map_err(|e| {
        anyhow::anyhow!(
            "backup {} -> {} failed: {e}",
            binary_path.display(),
            backup_path.display()
        )
    })?;
    tracing::info!("Current binary backed up to {}", backup_path.display());
    Ok(())
}

/// Restore the backup over `binary_path` after a failed apply.
pub fn rollback(backup_path: &Path, binary_path: &Path) -> anyhow::Result<()> {
    if !backup_path.exists() {
        anyhow::bail!("no backup at {}", backup_path.display());
    }
    std::fs::copy(backup_path, binary_path).map_err(|e| {
        anyhow::anyhow!(
            "rollback copy {} -> {} failed: {e}",
            backup_path.display(),
            binary_path.display()
        )
    })?;
    set_executable(binary_path)?;
    tracing::info!("Rolled back to {}", backup_path.display());
    Ok(())
}

/// Restart hook signature. Injectable so tests stay offline; the default
/// hands the swap to the host's supervisor and exits 0.
pub type RestartFn = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Ask the supervisor to restart us with the new binary.
///
/// When running as a systemd service, `systemctl restart --no-block` is
/// issued first so the unit restarts even if the exit alone would not
/// trigger it. Either way the process then exits 0 and the supervisor
/// performs the swap.
pub fn restart_via_supervisor(service_name: Option<&str>) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    if let Some(name) = service_name {
        let unit = format!("{name}.service");
        let status = std::process::Command::new("sudo")
            .args(["systemctl", "restart", "--no-block", &unit])
            .status();
        match status {
            Ok(s) if s.success() => tracing::info!(%unit, "Requested service restart"),
            Ok(s) => tracing::warn!(%unit, code = ?s.code(), "systemctl restart returned non-zero"),
            Err(e) => tracing::warn!(%unit, "systemctl restart failed: {e}"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = service_name;

    tracing::info!("Exiting for restart");
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_install_moves_bytes_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staged");
        let binary = dir.path().join("pm-agent");
        std::fs::write(&staging, b"new-agent-binary").unwrap();
        std::fs::write(&binary, b"old").unwrap();

        install_staged(&staging, &binary).unwrap();

        assert_eq!(std::fs::read(&binary).unwrap(), b"new-agent-binary");
        assert!(!staging.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn backup_and_rollback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("pm-agent");
        let backup = dir.path().join("backups").join("agent-1.0.0-linux-x86_64");
        std::fs::create_dir_all(backup.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"v1").unwrap();

        backup_current(&binary, &backup).unwrap();
        std::fs::write(&binary, b"broken-v2").unwrap();

        rollback(&backup, &binary).unwrap();
        assert_eq!(std::fs::read(&binary).unwrap(), b"v1");
    }

    #[test]
    fn rollback_without_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("pm-agent");
        std::fs::write(&binary, b"v2").unwrap();

        let err = rollback(&dir.path().join("missing"), &binary).unwrap_err();
        assert!(err.to_string().contains("no backup"));
        // Primary binary untouched.
        assert_eq!(std::fs::read(&binary).unwrap(), b"v2");
    }
}
