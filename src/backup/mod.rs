//! Backup manager (C8): periodic snapshots, optional remote upload, and
//! local retention by count, per spec.md §4.8.

pub mod uploader;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::shutdown::Shutdown;
use crate::store::Store;
use uploader::Uploader;

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub interval: Duration,
    pub local_dir: PathBuf,
    pub keep_last: usize,
}

/// Runs the backup scheduler: an immediate snapshot at startup, then one
/// every `interval`, until `shutdown` fires.
#[instrument(name = "backup::run", skip_all, level = "info")]
pub async fn run(store: Store, config: BackupConfig, uploader: Option<Arc<dyn Uploader>>, shutdown: Shutdown) {
    if let Err(err) = std::fs::create_dir_all(&config.local_dir) {
        tracing::error!(error = %err, dir = %config.local_dir.display(), "failed to create backup directory, disabling backups");
        return;
    }

    run_once(&store, &config, uploader.as_deref(), &shutdown).await;

    let mut interval = tokio::time::interval(config.interval);
    interval.tick().await; // first tick fires immediately; we already ran once above
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_once(&store, &config, uploader.as_deref(), &shutdown).await;
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("backup scheduler shutting down");
                return;
            }
        }
    }
}

/// Runs a single snapshot cycle: snapshot → optional upload → local prune.
/// Upload failures do not prevent the cycle from completing, per spec.md §4.8.
#[instrument(name = "backup::run_once", skip_all, level = "info")]
async fn run_once(store: &Store, config: &BackupConfig, uploader: Option<&dyn Uploader>, shutdown: &Shutdown) {
    crate::metrics::BACKUP_RUNS_TOTAL.inc();
    let file_name = format!("lotus-{}.db", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    let local_path = config.local_dir.join(&file_name);

    if let Err(err) = store.snapshot_to(local_path.clone()).await {
        tracing::error!(error = %err, "snapshot failed, skipping this backup cycle");
        return;
    }
    tracing::info!(path = %local_path.display(), "snapshot complete");
    crate::metrics::BACKUP_LAST_SUCCESS_UNIX.set(chrono::Utc::now().timestamp() as f64);

    if let Some(uploader) = uploader {
        if let Err(err) = uploader.upload(&local_path, shutdown).await {
            tracing::error!(error = %err, "snapshot upload failed, keeping local copy");
        }
    }

    if let Err(err) = prune_local(&config.local_dir, config.keep_last) {
        tracing::error!(error = %err, "failed to prune local snapshots");
    }
}

/// Keeps at most `keep_last` snapshot files in `dir`, deleting the oldest
/// first by the embedded `YYYYMMDD-HHMMSS` timestamp in the file name.
fn prune_local(dir: &Path, keep_last: usize) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| is_snapshot_file(path))
        .collect();
    entries.sort();

    if entries.len() <= keep_last {
        return Ok(());
    }
    let excess = entries.len() - keep_last;
    for path in &entries[..excess] {
        tracing::info!(path = %path.display(), "pruning old snapshot");
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn is_snapshot_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("lotus-") && n.ends_with(".db"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_snapshots_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(None, 4, Duration::from_secs(5)).unwrap();
        let shutdown = Shutdown::new();
        let config = BackupConfig { interval: Duration::from_secs(3600), local_dir: dir.path().to_path_buf(), keep_last: 2 };

        for _ in 0..3 {
            run_once(&store, &config, None, &shutdown).await;
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn prune_local_keeps_newest_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["lotus-20260101-000000.db", "lotus-20260102-000000.db", "lotus-20260103-000000.db"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        prune_local(dir.path(), 2).unwrap();
        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["lotus-20260102-000000.db".to_string(), "lotus-20260103-000000.db".to_string()]);
    }
}
