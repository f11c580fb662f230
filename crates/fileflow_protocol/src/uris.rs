//! Store location URIs.
//!
//! The drop, archive, duplicate, and quarantine directories are
//! configured as URIs. `file://` (or a bare path) resolves to the local
//! filesystem; `s3://`, `gs://`, and Azure blob URLs are recognised so a
//! cloud store adapter can plug in behind the same seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Backing store family for a configured directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreScheme {
    Local,
    S3,
    Gcs,
    AzureBlob,
}

impl StoreScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreScheme::Local => "local",
            StoreScheme::S3 => "s3",
            StoreScheme::Gcs => "gcs",
            StoreScheme::AzureBlob => "azure_blob",
        }
    }
}

/// A parsed store directory URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUri {
    pub scheme: StoreScheme,
    /// Path within the store: filesystem path, or `bucket/prefix`.
    pub path: PathBuf,
    pub original: String,
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self, String> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err("store URI is empty".to_string());
        }

        // Bare paths are local directories.
        let Some((scheme_str, rest)) = trimmed.split_once("://") else {
            return Ok(Self {
                scheme: StoreScheme::Local,
                path: PathBuf::from(trimmed),
                original: trimmed.to_string(),
            });
        };

        let (scheme, path) = match scheme_str {
            "file" => (StoreScheme::Local, PathBuf::from(rest)),
            "s3" => (StoreScheme::S3, PathBuf::from(rest)),
            "gs" => (StoreScheme::Gcs, PathBuf::from(rest)),
            "https" if rest.contains(".blob.core.windows.net") => {
                let container = rest
                    .split_once('/')
                    .map(|(_, c)| c)
                    .ok_or_else(|| format!("Azure blob URI '{}' is missing a container", uri))?;
                (StoreScheme::AzureBlob, PathBuf::from(container))
            }
            other => return Err(format!("unsupported store scheme '{}'", other)),
        };

        if path.as_os_str().is_empty() {
            return Err(format!("store URI '{}' is missing a path", uri));
        }

        Ok(Self {
            scheme,
            path,
            original: trimmed.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        self.scheme == StoreScheme::Local
    }
}

impl FromStr for StoreUri {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StoreUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_path_is_local() {
        let uri = StoreUri::parse("/data/drop").unwrap();
        assert_eq!(uri.scheme, StoreScheme::Local);
        assert_eq!(uri.path, PathBuf::from("/data/drop"));
    }

    #[test]
    fn file_scheme_is_local() {
        let uri = StoreUri::parse("file:///data/drop").unwrap();
        assert_eq!(uri.scheme, StoreScheme::Local);
        assert_eq!(uri.path, PathBuf::from("/data/drop"));
    }

    #[test]
    fn s3_and_gcs_parse() {
        assert_eq!(
            StoreUri::parse("s3://bucket/inbound").unwrap().scheme,
            StoreScheme::S3
        );
        assert_eq!(
            StoreUri::parse("gs://bucket/inbound").unwrap().scheme,
            StoreScheme::Gcs
        );
    }

    #[test]
    fn azure_blob_parses_container() {
        let uri =
            StoreUri::parse("https://acct.blob.core.windows.net/container/inbound").unwrap();
        assert_eq!(uri.scheme, StoreScheme::AzureBlob);
        assert_eq!(uri.path, PathBuf::from("container/inbound"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(StoreUri::parse("ftp://host/dir").is_err());
    }
}
