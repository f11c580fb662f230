//! File store abstraction.
//!
//! The pipeline sees directories through the [`FileStore`] trait:
//! list a drop directory, open a byte stream, move/copy/delete, and
//! compute a content hash. The local filesystem implementation ships
//! here; object-store implementations plug in behind the same trait.

pub mod local;

pub use local::LocalFileStore;

use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {dir} failed: {source}")]
    Listing {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not a file: {0}")]
    NotAFile(PathBuf),
}

impl StoreError {
    /// Transient errors are retried by the pipeline's backoff helper.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        let source = match self {
            StoreError::Listing { source, .. }
            | StoreError::Open { source, .. }
            | StoreError::Io { source, .. } => source,
            StoreError::NotAFile(_) => return false,
        };
        matches!(
            source.kind(),
            ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One file visible in a store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
}

impl FileEntry {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Extension with a trailing `.gz` stripped, lowercased.
    pub fn data_extension(&self) -> String {
        let name = self.file_name();
        let base = name.strip_suffix(".gz").unwrap_or(name);
        Path::new(base)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
}

/// Uniform list/open/move/delete/hash over a directory tree.
pub trait FileStore: Send + Sync {
    /// Recursively enumerate files under `dir`, sorted by path.
    fn list(&self, dir: &Path) -> Result<Vec<FileEntry>>;

    /// Open a file as a byte stream.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Copy `src` into `dst_dir`, keeping the base name. Returns the
    /// destination path. Existing names get a numeric suffix.
    fn copy_into(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf>;

    /// Move `src` into `dst_dir`, keeping the base name.
    fn move_into(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Streaming blake3 hash of the file content. When `decode_gzip` is
    /// set the hash covers the decompressed bytes, so a re-compressed
    /// upload of the same data still deduplicates.
    fn content_hash(&self, path: &Path, decode_gzip: bool) -> Result<String>;
}
