use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{error, warn};

use crate::error::{AppError, AppResult};
use crate::models::RunRecord;

/// Write `contents` to `path` atomically: write to a sibling temp file in
/// the same directory, then rename over the destination so readers never
/// observe a partial write.
pub async fn atomic_write(path: &Path, contents: &str) -> AppResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::IOError(std::io::Error::other("path has no file name")))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Append one [`RunRecord`] as a JSONL line to `path`, pruning the file
/// down to its newest half once it exceeds `max_bytes`. Pruning failures
/// are logged, not propagated — a stale-but-growing log is preferable to
/// losing the record we just tried to append.
pub async fn append_run_record(path: &Path, record: &RunRecord, max_bytes: u64) -> AppResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let line = serde_json::to_string(record)
        .map_err(|e| AppError::IOError(std::io::Error::other(e.to_string())))?;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    drop(file);

    if let Ok(metadata) = tokio::fs::metadata(path).await {
        if metadata.len() > max_bytes {
            if let Err(e) = prune_run_log(path).await {
                warn!(error = %e, "failed to prune runs.log, leaving it oversized");
            }
        }
    }

    Ok(())
}

/// Keep only the newest half of `path`'s lines, rewritten atomically.
async fn prune_run_log(path: &Path) -> AppResult<()> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.lines().collect();
    let keep_from = lines.len() / 2;
    let pruned = lines[keep_from..].join("\n");
    let pruned = if pruned.is_empty() {
        pruned
    } else {
        format!("{pruned}\n")
    };
    atomic_write(path, &pruned).await
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is a critical
/// initialization failure that should halt the application.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                panic!("Critical: cannot install Ctrl+C signal handler");
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                panic!("Critical: cannot install SIGTERM signal handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{RunStatus, StageDurations};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_record() -> RunRecord {
        RunRecord {
            run_id: Uuid::nil(),
            ts: Utc::now(),
            total_configs: 10,
            reachable: 4,
            sources: 2,
            durations: StageDurations::default(),
            status: RunStatus::Done,
        }
    }

    #[tokio::test]
    async fn append_run_record_writes_one_jsonl_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.log");

        append_run_record(&path, &sample_record(), u64::MAX).await.unwrap();
        append_run_record(&path, &sample_record(), u64::MAX).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        for line in contents.lines() {
            assert!(serde_json::from_str::<RunRecord>(line).is_ok());
        }
    }

    #[tokio::test]
    async fn append_run_record_prunes_once_over_the_byte_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.log");

        for _ in 0..20 {
            append_run_record(&path, &sample_record(), 200).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.lines().count() < 20);
    }
}
