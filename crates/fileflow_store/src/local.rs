//! Local filesystem store.

use crate::{FileEntry, FileStore, Result, StoreError};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const HASH_BUF_BYTES: usize = 64 * 1024;

/// Filesystem-backed [`FileStore`].
#[derive(Debug, Default, Clone)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }

    /// Pick a destination path under `dst_dir`, suffixing the stem when
    /// the base name is already taken.
    fn destination(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf> {
        let name = src
            .file_name()
            .ok_or_else(|| StoreError::NotAFile(src.to_path_buf()))?;
        fs::create_dir_all(dst_dir).map_err(|source| StoreError::Io {
            path: dst_dir.to_path_buf(),
            source,
        })?;
        let mut candidate = dst_dir.join(name);
        let mut attempt = 0u32;
        while candidate.exists() {
            attempt += 1;
            let mut renamed = name.to_os_string();
            renamed.push(format!(".{}", attempt));
            candidate = dst_dir.join(renamed);
        }
        Ok(candidate)
    }
}

impl FileStore for LocalFileStore {
    fn list(&self, dir: &Path) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(|e| StoreError::Listing {
                dir: dir.to_path_buf(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error")),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry
                .metadata()
                .map(|m| m.len())
                .map_err(|e| StoreError::Listing {
                    dir: dir.to_path_buf(),
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata error")),
                })?;
            entries.push(FileEntry {
                path: entry.into_path(),
                size,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(dir = %dir.display(), count = entries.len(), "listed store directory");
        Ok(entries)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = File::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn copy_into(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf> {
        let dst = self.destination(src, dst_dir)?;
        fs::copy(src, &dst).map_err(|source| StoreError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        Ok(dst)
    }

    fn move_into(&self, src: &Path, dst_dir: &Path) -> Result<PathBuf> {
        let dst = self.destination(src, dst_dir)?;
        match fs::rename(src, &dst) {
            Ok(()) => Ok(dst),
            // Cross-device moves fall back to copy + delete.
            Err(_) => {
                fs::copy(src, &dst).map_err(|source| StoreError::Io {
                    path: src.to_path_buf(),
                    source,
                })?;
                fs::remove_file(src).map_err(|source| StoreError::Io {
                    path: src.to_path_buf(),
                    source,
                })?;
                Ok(dst)
            }
        }
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn content_hash(&self, path: &Path, decode_gzip: bool) -> Result<String> {
        let file = self.open(path)?;
        let mut reader: Box<dyn Read + Send> = if decode_gzip {
            Box::new(GzDecoder::new(file))
        } else {
            file
        };

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; HASH_BUF_BYTES];
        loop {
            let n = reader.read(&mut buf).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn list_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        write_file(dir.path(), "b.csv", b"b");
        write_file(&dir.path().join("nested"), "a.csv", b"a");
        let store = LocalFileStore::new();
        let entries = store.list(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].path.ends_with("b.csv"));
        assert!(entries[1].path.ends_with("nested/a.csv"));
    }

    #[test]
    fn move_into_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        let first = write_file(dir.path(), "f.csv", b"one");
        let store = LocalFileStore::new();
        let moved = store.move_into(&first, &dst).unwrap();
        assert!(moved.ends_with("f.csv"));

        let second = write_file(dir.path(), "f.csv", b"two");
        let moved = store.move_into(&second, &dst).unwrap();
        assert!(moved.ends_with("f.csv.1"));
        assert!(!second.exists());
    }

    #[test]
    fn gzip_hash_matches_plain_hash() {
        let dir = tempfile::tempdir().unwrap();
        let plain = write_file(dir.path(), "data.csv", b"id,name\n1,a\n");

        let gz_path = dir.path().join("data.csv.gz");
        let mut encoder = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        encoder.write_all(b"id,name\n1,a\n").unwrap();
        encoder.finish().unwrap();

        let store = LocalFileStore::new();
        let plain_hash = store.content_hash(&plain, false).unwrap();
        let gz_hash = store.content_hash(&gz_path, true).unwrap();
        assert_eq!(plain_hash, gz_hash);
    }

    #[test]
    fn data_extension_strips_gz() {
        let entry = FileEntry {
            path: PathBuf::from("/drop/sales.parquet.gz"),
            size: 1,
        };
        assert_eq!(entry.data_extension(), "parquet");
    }
}
