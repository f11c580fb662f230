//! Stage writer.
//!
//! Accumulates validated rows and DLQ rows in separate buffers and
//! flushes each through the adapter's bulk insert when it reaches the
//! batch size, plus once at end of stream. A transient insert failure
//! re-attempts the same buffer; DLQ inserts are idempotent on their
//! primary key, stage inserts are plain appends.

use crate::failure::CancellationToken;
use crate::failure::LoadFailure;
use crate::retry::{RetryError, RetryPolicy};
use crate::validate::ValidatedBatch;
use chrono::Utc;
use fileflow_db::{DbAdapter, DlqRow};
use fileflow_protocol::{FieldValue, FileLoadId, LoadErrorKind, SourceConfig};
use std::sync::Arc;
use tracing::debug;

pub struct StageWriter<'a> {
    db: &'a Arc<dyn DbAdapter>,
    source: &'a SourceConfig,
    stage: &'a str,
    file_load_id: FileLoadId,
    batch_size: usize,
    retry: &'a RetryPolicy,
    cancel: &'a CancellationToken,
    valid_buffer: Vec<Vec<FieldValue>>,
    dlq_buffer: Vec<DlqRow>,
    pub rows_valid: u64,
    pub rows_invalid: u64,
}

impl<'a> StageWriter<'a> {
    pub fn new(
        db: &'a Arc<dyn DbAdapter>,
        source: &'a SourceConfig,
        stage: &'a str,
        file_load_id: FileLoadId,
        batch_size: usize,
        retry: &'a RetryPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            db,
            source,
            stage,
            file_load_id,
            batch_size,
            retry,
            cancel,
            valid_buffer: Vec::new(),
            dlq_buffer: Vec::new(),
            rows_valid: 0,
            rows_invalid: 0,
        }
    }

    /// Take ownership of a validated batch and flush full buffers.
    pub async fn push(&mut self, batch: ValidatedBatch) -> Result<(), LoadFailure> {
        self.rows_valid += batch.valid.len() as u64;
        self.rows_invalid += batch.invalid.len() as u64;

        self.valid_buffer
            .extend(batch.valid.into_iter().map(|row| row.values));
        let created_at = Utc::now();
        self.dlq_buffer
            .extend(batch.invalid.into_iter().map(|failure| DlqRow {
                file_load_id: self.file_load_id,
                source_name: self.source.name.clone(),
                source_row_number: failure.row,
                grain_key: failure.grain_key,
                failed_fields: failure.failed_fields,
                reasons: failure.reasons,
                original_row_json: failure.original_row_json,
                created_at,
            }));

        if self.valid_buffer.len() >= self.batch_size {
            self.flush_valid().await?;
        }
        if self.dlq_buffer.len() >= self.batch_size {
            self.flush_dlq().await?;
        }
        Ok(())
    }

    /// Flush remaining buffers; returns (rows_valid, rows_invalid).
    pub async fn finish(mut self) -> Result<(u64, u64), LoadFailure> {
        self.flush_valid().await?;
        self.flush_dlq().await?;
        Ok((self.rows_valid, self.rows_invalid))
    }

    async fn flush_valid(&mut self) -> Result<(), LoadFailure> {
        if self.valid_buffer.is_empty() {
            return Ok(());
        }
        let result = self
            .retry
            .run("stage_insert", self.cancel, || {
                self.db
                    .bulk_insert(self.stage, &self.source.fields, &self.valid_buffer)
            })
            .await;
        match result {
            Ok(inserted) => {
                debug!(stage = self.stage, rows = inserted, "flushed stage buffer");
                self.valid_buffer.clear();
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(LoadFailure::cancelled()),
            Err(other) => Err(LoadFailure::new(
                LoadErrorKind::BulkInsertFailed,
                format!("stage insert: {}", other),
            )),
        }
    }

    async fn flush_dlq(&mut self) -> Result<(), LoadFailure> {
        if self.dlq_buffer.is_empty() {
            return Ok(());
        }
        let result = self
            .retry
            .run("dlq_insert", self.cancel, || {
                self.db.insert_dlq_rows(&self.dlq_buffer)
            })
            .await;
        match result {
            Ok(inserted) => {
                debug!(rows = inserted, "flushed dlq buffer");
                self.dlq_buffer.clear();
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(LoadFailure::cancelled()),
            Err(other) => Err(LoadFailure::new(
                LoadErrorKind::BulkInsertFailed,
                format!("dlq insert: {}", other),
            )),
        }
    }
}
