//! Canonical load states, identifiers, and the error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canonical identifier for one file load attempt.
///
/// Allocated by the database (sequence or allocator table) when the
/// `Running` row is inserted into `file_load_log`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct FileLoadId(i64);

impl FileLoadId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FileLoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileLoadId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Terminal and in-flight states recorded in `file_load_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Running => "running",
            LoadState::Succeeded => "succeeded",
            LoadState::Failed => "failed",
            LoadState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadState::Running)
    }
}

impl FromStr for LoadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LoadState::Running),
            "succeeded" => Ok(LoadState::Succeeded),
            "failed" => Ok(LoadState::Failed),
            "cancelled" => Ok(LoadState::Cancelled),
            other => Err(format!("unknown load state: {}", other)),
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who gets told about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Business stakeholders, by email. The file itself is at fault.
    Stakeholder,
    /// The data team, by webhook. The system is at fault.
    Internal,
    /// Log only.
    None,
}

/// Failure kinds for a single file load.
///
/// The kind decides the notification audience and where the source file
/// ends up (quarantine vs duplicates directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    #[error("file has no header row")]
    MissingHeader,
    #[error("file is missing configured columns")]
    MissingColumns,
    #[error("file contains no data rows")]
    NoDataInFile,
    #[error("grain uniqueness violated on stage")]
    GrainValidationError,
    #[error("audit check failed")]
    AuditFailedError,
    #[error("validation error threshold exceeded")]
    ValidationThresholdExceeded,
    #[error("file already loaded successfully")]
    DuplicateFile,
    #[error("archive copy failed")]
    ArchiveFailed,
    #[error("stage table creation failed")]
    StageCreateFailed,
    #[error("bulk insert failed")]
    BulkInsertFailed,
    #[error("publish merge failed")]
    PublishFailed,
    #[error("database unavailable")]
    DbUnavailable,
    #[error("file store unavailable")]
    StoreUnavailable,
    #[error("configuration error")]
    ConfigError,
    #[error("worker panicked")]
    WorkerPanic,
    #[error("cancelled")]
    Cancelled,
}

impl LoadErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadErrorKind::MissingHeader => "missing_header",
            LoadErrorKind::MissingColumns => "missing_columns",
            LoadErrorKind::NoDataInFile => "no_data_in_file",
            LoadErrorKind::GrainValidationError => "grain_validation_error",
            LoadErrorKind::AuditFailedError => "audit_failed_error",
            LoadErrorKind::ValidationThresholdExceeded => "validation_threshold_exceeded",
            LoadErrorKind::DuplicateFile => "duplicate_file",
            LoadErrorKind::ArchiveFailed => "archive_failed",
            LoadErrorKind::StageCreateFailed => "stage_create_failed",
            LoadErrorKind::BulkInsertFailed => "bulk_insert_failed",
            LoadErrorKind::PublishFailed => "publish_failed",
            LoadErrorKind::DbUnavailable => "db_unavailable",
            LoadErrorKind::StoreUnavailable => "store_unavailable",
            LoadErrorKind::ConfigError => "config_error",
            LoadErrorKind::WorkerPanic => "worker_panic",
            LoadErrorKind::Cancelled => "cancelled",
        }
    }

    /// Which audience is notified when a file fails with this kind.
    pub fn audience(&self) -> Audience {
        match self {
            LoadErrorKind::MissingHeader
            | LoadErrorKind::MissingColumns
            | LoadErrorKind::NoDataInFile
            | LoadErrorKind::GrainValidationError
            | LoadErrorKind::AuditFailedError
            | LoadErrorKind::ValidationThresholdExceeded
            | LoadErrorKind::DuplicateFile => Audience::Stakeholder,
            LoadErrorKind::ArchiveFailed
            | LoadErrorKind::StageCreateFailed
            | LoadErrorKind::BulkInsertFailed
            | LoadErrorKind::PublishFailed
            | LoadErrorKind::DbUnavailable
            | LoadErrorKind::StoreUnavailable
            | LoadErrorKind::ConfigError
            | LoadErrorKind::WorkerPanic => Audience::Internal,
            LoadErrorKind::Cancelled => Audience::None,
        }
    }

    /// Duplicate files park in the duplicates directory; everything else
    /// that fails goes to quarantine.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LoadErrorKind::DuplicateFile)
    }
}

/// Row counts carried through a load and written to `file_load_log`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCounts {
    pub rows_read: u64,
    pub rows_valid: u64,
    pub rows_invalid: u64,
    pub rows_published: u64,
}

impl LoadCounts {
    /// Row conservation: everything read is either valid or invalid.
    pub fn is_conserved(&self) -> bool {
        self.rows_read == self.rows_valid + self.rows_invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_state_round_trip() {
        for state in [
            LoadState::Running,
            LoadState::Succeeded,
            LoadState::Failed,
            LoadState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<LoadState>().unwrap(), state);
        }
    }

    #[test]
    fn stakeholder_kinds_are_file_level() {
        assert_eq!(
            LoadErrorKind::ValidationThresholdExceeded.audience(),
            Audience::Stakeholder
        );
        assert_eq!(LoadErrorKind::PublishFailed.audience(), Audience::Internal);
        assert_eq!(LoadErrorKind::Cancelled.audience(), Audience::None);
    }

    #[test]
    fn counts_conservation() {
        let counts = LoadCounts {
            rows_read: 10,
            rows_valid: 7,
            rows_invalid: 3,
            rows_published: 7,
        };
        assert!(counts.is_conserved());
    }
}
