//! The database capability seam.
//!
//! One [`DbAdapter`] instance is shared by all workers; it owns a
//! connection pool sized at least W+2. Orchestration code only ever
//! talks to this trait, so engines differ in the adapter and the
//! [`Dialect`](crate::Dialect) SQL, never in the pipeline.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_protocol::{FieldSchema, FileLoadId, LoadCounts, LoadErrorKind, LoadState};

/// A validation failure persisted to `file_load_dlq`.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqRow {
    pub file_load_id: FileLoadId,
    pub source_name: String,
    pub source_row_number: u64,
    /// `|`-joined grain key of the failing row, when the grain fields
    /// themselves validated; used by the self-healing delete.
    pub grain_key: Option<String>,
    pub failed_fields: Vec<String>,
    pub reasons: Vec<String>,
    pub original_row_json: String,
    pub created_at: DateTime<Utc>,
}

/// Result of one publish (merge + DLQ healing) transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub rows_published: u64,
    pub dlq_cleared: u64,
}

/// One row of `file_load_log`.
#[derive(Debug, Clone)]
pub struct LoadLogRow {
    pub file_load_id: FileLoadId,
    pub source_name: String,
    pub filename: String,
    pub content_hash: Option<String>,
    pub state: LoadState,
    pub counts: LoadCounts,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
}

/// Connect, introspect, stage, bulk insert, audit, merge.
#[async_trait]
pub trait DbAdapter: Send + Sync {
    fn dialect(&self) -> crate::Dialect;

    /// Create `file_load_log` and `file_load_dlq` when absent.
    async fn ensure_control_tables(&self) -> Result<()>;

    /// Allocate a file_load_id and insert a `Running` log row.
    /// Serialisable: ids are unique and monotone across workers.
    async fn begin_load(&self, source_name: &str, filename: &str) -> Result<FileLoadId>;

    /// Record the streaming content hash once computed.
    async fn set_content_hash(&self, id: FileLoadId, content_hash: &str) -> Result<()>;

    /// A prior `Succeeded` load of the same (filename, content hash),
    /// excluding the current attempt.
    async fn find_duplicate(
        &self,
        id: FileLoadId,
        filename: &str,
        content_hash: &str,
    ) -> Result<Option<FileLoadId>>;

    /// Close the log row with a terminal state and final counts.
    async fn finish_load(
        &self,
        id: FileLoadId,
        state: LoadState,
        counts: LoadCounts,
        error_kind: Option<LoadErrorKind>,
        error_detail: Option<&str>,
    ) -> Result<()>;

    async fn fetch_load(&self, id: FileLoadId) -> Result<LoadLogRow>;

    /// Create the per-file stage table plus its grain index.
    async fn create_stage_table(
        &self,
        stage: &str,
        fields: &[FieldSchema],
        grain: &[String],
    ) -> Result<()>;

    async fn drop_stage_table(&self, stage: &str) -> Result<()>;

    /// Multi-row insert of typed rows, in schema field order.
    async fn bulk_insert(
        &self,
        table: &str,
        fields: &[FieldSchema],
        rows: &[Vec<fileflow_protocol::FieldValue>],
    ) -> Result<u64>;

    /// Idempotent DLQ insert keyed on (file_load_id, source_row_number).
    async fn insert_dlq_rows(&self, rows: &[DlqRow]) -> Result<u64>;

    /// Up to `limit` human-readable reasons for a load, in row order.
    async fn dlq_reason_sample(&self, id: FileLoadId, limit: u32) -> Result<Vec<String>>;

    /// DLQ rows remaining for a source (tests and reporting).
    async fn dlq_count(&self, source_name: &str) -> Result<u64>;

    /// Run a read-only scalar query (audits). `None` when the query
    /// returns no row or a NULL scalar.
    async fn execute_scalar(&self, sql: &str) -> Result<Option<f64>>;

    /// First duplicated grain key on the stage table, if any.
    async fn first_duplicate_grain(&self, stage: &str, grain: &[String]) -> Result<Option<String>>;

    /// Merge stage into target by grain and clear healed DLQ rows, in
    /// one transaction.
    async fn publish(
        &self,
        stage: &str,
        target: &str,
        fields: &[FieldSchema],
        grain: &[String],
        source_name: &str,
    ) -> Result<PublishOutcome>;
}
