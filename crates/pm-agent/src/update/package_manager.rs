//! Package-manager detection and delegation.
//!
//! When the agent binary is owned by dpkg or rpm, the built-in binary swap
//! is wrong — the package database would drift. Those hosts delegate the
//! whole update to apt/dnf/yum under sudo instead.

use std::path::Path;

use tokio::process::Command;

/// Sudo password prompts surface on stderr; seeing one means the sudoers
/// rule for unattended updates is missing.
const SUDO_PROMPT_MARKERS: &[&str] = &[
    "a password is required",
    "password for",
    "sudo: no tty present",
    "sudo: a terminal is required",
];

pub const SUDOERS_HELP: &str = "sudo requires a password on this host; install a sudoers rule such as \
'printmaster ALL=(root) NOPASSWD: /usr/bin/apt-get, /usr/bin/dnf, /usr/bin/yum, /usr/bin/systemctl' \
to allow unattended updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManagerKind {
    Apt,
    Dnf,
    Yum,
}

/// How this host applies updates, decided once at manager construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMode {
    /// Plain binary swap in a writable directory.
    Binary,
    /// Delegate to the OS package manager.
    Package(PackageManagerKind),
    /// Auto-update is off, with the reason surfaced to operators.
    Disabled(String),
}

fn tool_exists(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(".pm-write-probe");
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Classify the host. Ownership checks shell out to `dpkg-query -S` and
/// `rpm -qf`, matching what the package databases actually say.
pub fn detect_install_mode(binary_path: &Path) -> InstallMode {
    #[cfg(unix)]
    {
        let path = binary_path.to_string_lossy();

        let dpkg_owned = std::process::Command::new("dpkg-query")
            .args(["-S", path.as_ref()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if dpkg_owned {
            return if tool_exists("apt-get") {
                InstallMode::Package(PackageManagerKind::Apt)
            } else {
                InstallMode::Disabled(
                    "binary is dpkg-managed but apt-get is not installed".into(),
                )
            };
        }

        let rpm_owned = std::process::Command::new("rpm")
            .args(["-qf", path.as_ref()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if rpm_owned {
            return if tool_exists("dnf") {
                InstallMode::Package(PackageManagerKind::Dnf)
            } else if tool_exists("yum") {
                InstallMode::Package(PackageManagerKind::Yum)
            } else {
                InstallMode::Disabled("binary is rpm-managed but neither dnf nor yum is installed".into())
            };
        }
    }

    match binary_path.parent() {
        Some(dir) if dir_writable(dir) => InstallMode::Binary,
        Some(dir) => InstallMode::Disabled(format!(
            "binary directory {} is not writable and the binary is not package-managed",
            dir.display()
        )),
        None => InstallMode::Disabled("cannot determine binary directory".into()),
    }
}

/// Run one package-manager command under sudo, scanning stderr for a
/// password prompt.
async fn run_sudo(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new("sudo")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .arg(program)
        .args(args)
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("failed to spawn sudo {program}: {e}"))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let lowered = stderr.to_lowercase();
    if SUDO_PROMPT_MARKERS.iter().any(|m| lowered.contains(m)) {
        anyhow::bail!("{SUDOERS_HELP}");
    }
    if !output.status.success() {
        anyhow::bail!(
            "{program} {} exited with {:?}: {}",
            args.join(" "),
            output.status.code(),
            stderr.trim()
        );
    }
    Ok(())
}

/// Apply an update through the package manager. `progress` receives a
/// percentage per phase so the UI can animate.
pub async fn apply_package_update(
    kind: PackageManagerKind,
    package: &str,
    version: &str,
    progress: &(dyn Fn(u8) + Sync),
) -> anyhow::Result<()> {
    match kind {
        PackageManagerKind::Apt => {
            progress(10);
            run_sudo("apt-get", &["update", "-qq"]).await?;
            progress(40);
            let pin = format!("{package}={version}*");
            let pinned = run_sudo(
                "apt-get",
                &["install", "-y", "-qq", "--allow-downgrades", &pin],
            )
            .await;
            if let Err(e) = pinned {
                // The pinned version may not be in the repo yet.
                tracing::warn!("apt pinned install failed, falling back to unpinned: {e}");
                progress(60);
                run_sudo("apt-get", &["install", "-y", "-qq", package]).await?;
            }
            progress(100);
        }
        PackageManagerKind::Dnf => {
            progress(10);
            let pin = format!("{package}-{version}");
            let pinned = run_sudo(
                "dnf",
                &["--refresh", "install", "-y", "--allowerasing", &pin],
            )
            .await;
            if let Err(e) = pinned {
                tracing::warn!("dnf pinned install failed, falling back to upgrade: {e}");
                progress(60);
                run_sudo("dnf", &["--refresh", "upgrade", "-y", package]).await?;
            }
            progress(100);
        }
        PackageManagerKind::Yum => {
            progress(10);
            run_sudo("yum", &["clean", "metadata"]).await?;
            progress(40);
            let pin = format!("{package}-{version}");
            let pinned = run_sudo("yum", &["install", "-y", "-q", &pin]).await;
            if let Err(e) = pinned {
                tracing::warn!("yum pinned install failed, falling back to upgrade: {e}");
                progress(60);
                run_sudo("yum", &["upgrade", "-y", "-q", package]).await?;
            }
            progress(100);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_dir_means_binary_mode() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("pm-agent");
        std::fs::write(&binary, b"x").unwrap();
        // Not dpkg/rpm owned (temp file), dir writable.
        assert_eq!(detect_install_mode(&binary), InstallMode::Binary);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_dir_disables_updates() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("locked");
        std::fs::create_dir(&sub).unwrap();
        let binary = sub.join("pm-agent");
        std::fs::write(&binary, b"x").unwrap();
        std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o555)).unwrap();

        let mode = detect_install_mode(&binary);
        std::fs::set_permissions(&sub, std::fs::Permissions::from_mode(0o755)).unwrap();

        match mode {
            InstallMode::Disabled(reason) => assert!(reason.contains("not writable")),
            other => panic!("expected Disabled, got {other:?}"),
        }
    }

    #[test]
    fn sudo_prompt_markers_cover_common_phrasings() {
        for line in [
            "[sudo] password for printmaster:",
            "sudo: a password is required",
            "sudo: no tty present and no askpass program specified",
        ] {
            let lowered = line.to_lowercase();
            assert!(
                SUDO_PROMPT_MARKERS.iter().any(|m| lowered.contains(m)),
                "unmatched: {line}"
            );
        }
    }
}
