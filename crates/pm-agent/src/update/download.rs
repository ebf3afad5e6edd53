//! Download retry loop with `.partial` resume.
//!
//! Each attempt stats the partial file and asks the client to resume from
//! its size. Failures back off exponentially (doubled per attempt, capped
//! at five minutes, plus jitter); the cancellation latch aborts between
//! attempts and between chunks inside the client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::client::{ProgressFn, UpdateClient};

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Download `url` to `dest`, resuming an existing partial file and retrying
/// up to `max_retries` times. Returns the final file size in bytes.
pub async fn download_with_retries(
    client: &dyn UpdateClient,
    url: &str,
    dest: &Path,
    expected_total: u64,
    max_retries: u32,
    progress: Option<ProgressFn>,
    cancelled: &AtomicBool,
) -> anyhow::Result<u64> {
    let partial = partial_path(dest);
    let mut delay = INITIAL_RETRY_DELAY;
    let mut last_error = None;

    for attempt in 1..=max_retries.max(1) {
        if cancelled.load(Ordering::SeqCst) {
            anyhow::bail!("download cancelled");
        }

        let resume_from = tokio::fs::metadata(&partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if resume_from > 0 {
            tracing::info!(
                attempt,
                resume_from,
                "Resuming partial download of {}",
                dest.display()
            );
        }

        match client
            .download(url, &partial, resume_from, expected_total, progress.clone(), cancelled)
            .await
        {
            Ok(written) => {
                let size = tokio::fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);
                if written > 0 || size > 0 {
                    tokio::fs::rename(&partial, dest).await?;
                    tracing::info!(bytes = size, "Download complete: {}", dest.display());
                    return Ok(size);
                }
                last_error = Some(anyhow::anyhow!("empty download"));
            }
            Err(e) => {
                if cancelled.load(Ordering::SeqCst) {
                    anyhow::bail!("download cancelled");
                }
                tracing::warn!(attempt, "Download attempt failed: {e}");
                last_error = Some(e);
            }
        }

        if attempt < max_retries.max(1) {
            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..=(delay.as_millis() / 4).max(1) as u64),
            );
            tokio::time::sleep(delay + jitter).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("download failed")))
}
