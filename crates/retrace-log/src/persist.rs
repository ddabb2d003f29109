//! Disk persistence: the single consumer of the persistence queue.
//!
//! The flush task is the only writer of the backing file, so the file needs
//! no lock. Lines are batched and written when a batch fills or when the
//! flush interval elapses, whichever comes first.

use std::{path::Path, time::Duration};

use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc,
    time::MissedTickBehavior,
};

use crate::error::LogError;

/// Open `path` for appending, creating parent directories as needed.
pub(crate) async fn open_append(path: &Path) -> Result<File, LogError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| LogError::CreateDir { path: dir.to_path_buf(), source })?;
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await.map_err(|source| LogError::Open { path: path.to_path_buf(), source })
}

/// Drain `rx` into `file` until every sender is dropped.
pub(crate) async fn run_flusher(
    mut rx: mpsc::Receiver<String>,
    mut file: File,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= batch_size {
                        flush(&mut file, &mut batch).await;
                    }
                },
                None => {
                    flush(&mut file, &mut batch).await;
                    break;
                },
            },
            _ = ticker.tick() => flush(&mut file, &mut batch).await,
        }
    }

    if let Err(e) = file.sync_data().await {
        tracing::warn!("log file sync failed: {}", e);
    }
}

/// Write out and clear `batch`. Failed batches are dropped.
async fn flush(file: &mut File, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }

    let size = batch.iter().map(|line| line.len() + 1).sum();
    let mut buf = String::with_capacity(size);
    for line in batch.drain(..) {
        buf.push_str(&line);
        buf.push('\n');
    }

    if let Err(e) = file.write_all(buf.as_bytes()).await {
        tracing::warn!("log file write failed: {}", e);
        return;
    }
    if let Err(e) = file.flush().await {
        tracing::warn!("log file flush failed: {}", e);
    }
}
