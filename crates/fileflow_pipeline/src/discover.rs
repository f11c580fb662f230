//! Drop-directory discovery.
//!
//! One immutable snapshot per invocation: files that appear afterwards
//! wait for the next run, so a file is never enumerated twice within a
//! process. Directory walks are blocking store I/O and run in
//! spawn_blocking.

use crate::blocking::run_blocking;
use chrono::{DateTime, Utc};
use fileflow_store::{FileStore, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// One discovered file, queued for dispatch.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub path: PathBuf,
    pub size: u64,
    /// Data extension with any `.gz` stripped (`csv`, `parquet`, ...).
    pub extension: String,
    pub discovered_at: DateTime<Utc>,
}

impl FileJob {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Snapshot the drop directory into an ordered work queue.
///
/// A listing failure is fatal for the whole run (`ListingFailed`).
pub async fn snapshot(
    store: Arc<dyn FileStore>,
    dir: &Path,
) -> Result<Vec<FileJob>, StoreError> {
    let discovered_at = Utc::now();
    let list_dir = dir.to_path_buf();
    let entries = run_blocking(move || store.list(&list_dir)).await?;
    let jobs: Vec<FileJob> = entries
        .into_iter()
        .map(|entry| FileJob {
            extension: entry.data_extension(),
            size: entry.size,
            path: entry.path,
            discovered_at,
        })
        .collect();
    info!(dir = %dir.display(), files = jobs.len(), "discovery snapshot");
    Ok(jobs)
}

/// Queue a single explicit path (`run --file PATH`), bypassing the
/// drop-directory snapshot.
pub async fn single(
    store: Arc<dyn FileStore>,
    path: &Path,
) -> Result<Option<FileJob>, StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let entries = run_blocking(move || store.list(&parent)).await?;
    let discovered_at = Utc::now();
    Ok(entries
        .into_iter()
        .find(|entry| entry.path == path)
        .map(|entry| FileJob {
            extension: entry.data_extension(),
            size: entry.size,
            path: entry.path,
            discovered_at,
        }))
}
