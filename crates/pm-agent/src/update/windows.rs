//! Windows update helpers.
//!
//! A running executable cannot be overwritten on Windows, so the apply step
//! writes a batch helper into the state dir, launches it detached, and the
//! agent exits from the restart step; the helper performs the swap. MSI
//! installs write a different helper that delegates to msiexec.
//!
//! Script generation is plain string building so it is unit-testable on
//! every platform; only launching and registry probing are Windows-gated.

use std::path::{Path, PathBuf};

pub const UPDATE_HELPER_NAME: &str = "update_helper.bat";
pub const MSI_HELPER_NAME: &str = "msi_update_helper.bat";
pub const MSI_LOG_NAME: &str = "msi_update.log";

/// msiexec exit code meaning "installed, reboot pending" — a success.
pub const MSI_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

/// Quote a path for use inside a batch script. Paths are caller-controlled,
/// so this rejects anything a script could not safely carry and escapes the
/// two characters cmd.exe treats specially inside quotes.
pub fn bat_quote(path: &Path) -> anyhow::Result<String> {
    let raw = path.to_str().ok_or_else(|| {
        anyhow::anyhow!("path is not valid UTF-8: {}", path.display())
    })?;
    if raw.chars().any(|c| c.is_control() || c == '\n' || c == '\r') {
        anyhow::bail!("path contains control characters: {raw:?}");
    }
    let escaped = raw.replace('%', "%%").replace('"', "\"\"");
    Ok(format!("\"{escaped}\""))
}

/// Helper for a service-mode agent: stop the service, wait for STOPPED,
/// swap the binary (restoring the service on failure), start, self-delete.
pub fn service_update_script(
    staging: &Path,
    binary: &Path,
    service_name: &str,
) -> anyhow::Result<String> {
    let staging_q = bat_quote(staging)?;
    let binary_q = bat_quote(binary)?;
    if !service_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        anyhow::bail!("unsafe service name: {service_name:?}");
    }

    Ok(format!(
        r#"@echo off
rem PrintMaster agent update helper (service mode)
sc stop {service_name}
:wait_stop
timeout /t 1 /nobreak >nul
sc query {service_name} | findstr /C:"STOPPED" >nul
if errorlevel 1 goto wait_stop
copy /y {staging_q} {binary_q}
if errorlevel 1 (
    rem Swap failed: bring the old service back so the host is not bricked
    sc start {service_name}
    goto cleanup
)
sc start {service_name}
:cleanup
del {staging_q}
(goto) 2>nul & del "%~f0"
"#
    ))
}

/// Helper for a foreground agent: wait for the old process to exit, swap,
/// relaunch, self-delete.
pub fn standalone_update_script(staging: &Path, binary: &Path) -> anyhow::Result<String> {
    let staging_q = bat_quote(staging)?;
    let binary_q = bat_quote(binary)?;

    Ok(format!(
        r#"@echo off
rem PrintMaster agent update helper
timeout /t 2 /nobreak >nul
copy /y {staging_q} {binary_q}
if errorlevel 1 goto cleanup
start "" {binary_q}
:cleanup
del {staging_q}
(goto) 2>nul & del "%~f0"
"#
    ))
}

/// MSI helper: quiet install with verbose logging; 3010 counts as success.
pub fn msi_update_script(msi_path: &Path, log_path: &Path) -> anyhow::Result<String> {
    let msi_q = bat_quote(msi_path)?;
    let log_q = bat_quote(log_path)?;

    Ok(format!(
        r#"@echo off
rem PrintMaster agent MSI update helper
timeout /t 2 /nobreak >nul
msiexec /i {msi_q} /qn /norestart /l*v {log_q}
if %errorlevel% equ {MSI_SUCCESS_REBOOT_REQUIRED} exit /b 0
if errorlevel 1 exit /b %errorlevel%
(goto) 2>nul & del "%~f0"
"#
    ))
}

/// Write a helper script into the state dir and return its path.
pub fn write_helper(state_root: &Path, name: &str, content: &str) -> anyhow::Result<PathBuf> {
    let path = state_root.join(name);
    std::fs::write(&path, content)
        .map_err(|e| anyhow::anyhow!("write helper {}: {e}", path.display()))?;
    tracing::info!("Update helper written to {}", path.display());
    Ok(path)
}

/// Launch-hook signature; injectable so tests never spawn cmd.exe.
pub type LaunchHelperFn = Box<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// Launch a helper detached so it survives this process exiting.
#[cfg(windows)]
pub fn launch_helper(script: &Path) -> anyhow::Result<()> {
    let script_q = bat_quote(script)?;
    std::process::Command::new("cmd")
        .args(["/C", "start", "/min", "", &script_q])
        .spawn()
        .map_err(|e| anyhow::anyhow!("launch helper {}: {e}", script.display()))?;
    Ok(())
}

#[cfg(not(windows))]
pub fn launch_helper(script: &Path) -> anyhow::Result<()> {
    anyhow::bail!("update helper {} only runs on Windows", script.display())
}

/// Is the agent installed through the PrintMaster MSI? Checks the Windows
/// Installer uninstall registry for the product plus the expected
/// `%ProgramFiles%\PrintMaster` install path.
#[cfg(windows)]
pub fn is_msi_install() -> bool {
    let registry_hit = std::process::Command::new("reg")
        .args([
            "query",
            r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
            "/s",
            "/f",
            "PrintMaster Agent",
        ])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    let path_hit = std::env::var("ProgramFiles")
        .map(|pf| Path::new(&pf).join("PrintMaster").is_dir())
        .unwrap_or(false);

    registry_hit && path_hit
}

#[cfg(not(windows))]
pub fn is_msi_install() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_cmd_metacharacters() {
        let q = bat_quote(Path::new(r"C:\Program Files\PrintMaster\agent.exe")).unwrap();
        assert_eq!(q, r#""C:\Program Files\PrintMaster\agent.exe""#);

        let q = bat_quote(Path::new(r"C:\temp\%TEMP%\x")).unwrap();
        assert!(q.contains("%%TEMP%%"));

        let q = bat_quote(Path::new(r#"C:\odd"name"#)).unwrap();
        assert!(q.contains(r#"odd""name"#));

        assert!(bat_quote(Path::new("C:\\bad\nname")).is_err());
    }

    #[test]
    fn service_script_stops_swaps_and_recovers() {
        let script = service_update_script(
            Path::new(r"C:\state\staging\agent-2.0.0-windows-x86_64.exe"),
            Path::new(r"C:\Program Files\PrintMaster\pm-agent.exe"),
            "printmaster-agent",
        )
        .unwrap();

        assert!(script.contains("sc stop printmaster-agent"));
        assert!(script.contains(r#"findstr /C:"STOPPED""#));
        assert!(script.contains("copy /y"));
        // Failure path restarts the old service.
        assert!(script.contains("sc start printmaster-agent"));
        // Self-deletes.
        assert!(script.contains(r#"del "%~f0""#));

        assert!(service_update_script(
            Path::new("a"),
            Path::new("b"),
            "bad name; del c:\\"
        )
        .is_err());
    }

    #[test]
    fn standalone_script_relaunches_new_binary() {
        let script = standalone_update_script(
            Path::new(r"C:\state\staging\agent.exe"),
            Path::new(r"C:\tools\pm-agent.exe"),
        )
        .unwrap();
        assert!(script.contains(r#"start "" "C:\tools\pm-agent.exe""#));
        assert!(script.contains(r#"del "%~f0""#));
    }

    #[test]
    fn msi_script_treats_3010_as_success() {
        let script = msi_update_script(
            Path::new(r"C:\state\downloads\agent-2.0.0-windows-x86_64.msi"),
            Path::new(r"C:\state\msi_update.log"),
        )
        .unwrap();
        assert!(script.contains("msiexec /i"));
        assert!(script.contains("/qn /norestart /l*v"));
        assert!(script.contains("equ 3010 exit /b 0"));
    }

    #[test]
    fn write_helper_lands_in_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_helper(dir.path(), UPDATE_HELPER_NAME, "@echo off\n").unwrap();
        assert_eq!(path, dir.path().join("update_helper.bat"));
        assert!(path.exists());
    }
}
