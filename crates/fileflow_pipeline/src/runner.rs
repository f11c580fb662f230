//! Per-file orchestration.
//!
//! Ordered steps: archive, open the load log row, dedup by content
//! hash, create the stage table, stream read/validate/write, audit,
//! publish, cleanup. Any failure short-circuits to the cleanup path:
//! the stage table is always dropped, the source file always leaves the
//! drop directory (archive+delete on success, quarantine or duplicates
//! on failure), and the log row is always closed.

use crate::audit::run_audits;
use crate::blocking::run_blocking;
use crate::discover::FileJob;
use crate::failure::{CancellationToken, LoadFailure};
use crate::publish;
use crate::retry::{RetryError, RetryPolicy};
use crate::validate::RowValidator;
use crate::write::StageWriter;
use fileflow_db::DbAdapter;
use fileflow_notify::{EmailMessage, Notifier};
use fileflow_protocol::{
    AppConfig, Audience, FileLoadId, LoadCounts, LoadErrorKind, LoadState, SourceConfig,
};
use fileflow_readers::{maybe_gunzip, ReaderRegistry};
use fileflow_store::FileStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared dependencies for every worker.
pub struct PipelineContext {
    pub config: AppConfig,
    pub store: Arc<dyn FileStore>,
    pub db: Arc<dyn DbAdapter>,
    pub notifier: Arc<dyn Notifier>,
    pub readers: Arc<ReaderRegistry>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

/// Terminal result for one file.
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub filename: String,
    pub source_name: String,
    pub file_load_id: Option<FileLoadId>,
    pub state: LoadState,
    pub failure: Option<LoadFailure>,
    pub counts: LoadCounts,
}

impl FileOutcome {
    /// Internal faults count against the process exit code; file-level
    /// failures do not.
    pub fn is_internal_error(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.kind.audience() == Audience::Internal)
    }
}

#[derive(Default)]
struct RunState {
    file_load_id: Option<FileLoadId>,
    stage: Option<String>,
    counts: LoadCounts,
}

/// Runs one file to a terminal state. One runner per file, owned by
/// exactly one worker.
pub struct PipelineRunner<'a> {
    ctx: &'a PipelineContext,
    source: &'a SourceConfig,
}

impl<'a> PipelineRunner<'a> {
    pub fn new(ctx: &'a PipelineContext, source: &'a SourceConfig) -> Self {
        Self { ctx, source }
    }

    pub async fn run(&self, job: &FileJob) -> FileOutcome {
        let filename = job.file_name().to_string();
        info!(source = %self.source.name, file = %filename, "starting pipeline");

        let mut state = RunState::default();
        let result = self.execute(job, &mut state).await;

        match result {
            Ok(()) => {
                let outcome = self.close_success(job, &filename, &mut state).await;
                info!(
                    source = %self.source.name,
                    file = %filename,
                    rows_published = outcome.counts.rows_published,
                    "pipeline succeeded"
                );
                outcome
            }
            Err(failure) => {
                warn!(
                    source = %self.source.name,
                    file = %filename,
                    kind = failure.kind.as_str(),
                    detail = %failure.detail,
                    "pipeline failed"
                );
                self.close_failure(job, &filename, state, failure).await
            }
        }
    }

    async fn execute(&self, job: &FileJob, state: &mut RunState) -> Result<(), LoadFailure> {
        let ctx = self.ctx;
        let cancel = &ctx.cancel;
        cancel.checkpoint()?;

        // 1. Archive before touching the database. The copy is blocking
        // store I/O, so it runs in spawn_blocking.
        let archive_dir = ctx.config.archive_dir.path.clone();
        ctx.retry
            .run("archive", cancel, || {
                let store = Arc::clone(&ctx.store);
                let src = job.path.clone();
                let dst = archive_dir.clone();
                async move { run_blocking(move || store.copy_into(&src, &dst)).await }
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::ArchiveFailed, e))?;

        // 2. Allocate the file_load_id and open the log row.
        let filename = job.file_name();
        let id = ctx
            .retry
            .run("begin_load", cancel, || {
                ctx.db.begin_load(&self.source.name, filename)
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::DbUnavailable, e))?;
        state.file_load_id = Some(id);

        // 3. Dedup on the decoded content hash. Streaming the whole file
        // through blake3 is blocking I/O.
        let gzip = self.source.wants_gzip(&job.path);
        let hash = ctx
            .retry
            .run("content_hash", cancel, || {
                let store = Arc::clone(&ctx.store);
                let path = job.path.clone();
                async move { run_blocking(move || store.content_hash(&path, gzip)).await }
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::StoreUnavailable, e))?;
        ctx.retry
            .run("set_content_hash", cancel, || {
                ctx.db.set_content_hash(id, &hash)
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::DbUnavailable, e))?;
        let duplicate = ctx
            .retry
            .run("find_duplicate", cancel, || {
                ctx.db.find_duplicate(id, filename, &hash)
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::DbUnavailable, e))?;
        if let Some(prior) = duplicate {
            return Err(LoadFailure::new(
                LoadErrorKind::DuplicateFile,
                format!("already loaded successfully as file_load_id {}", prior),
            ));
        }

        // 4. Stage table with grain index. Recorded before creation so a
        // partial stage is still dropped.
        let stage = self.source.stage_table_name(id);
        state.stage = Some(stage.clone());
        ctx.retry
            .run("create_stage", cancel, || {
                ctx.db
                    .create_stage_table(&stage, &self.source.fields, &self.source.grain)
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::StageCreateFailed, e))?;

        // 5. Streamed read -> validate -> write. Opening the stream and
        // constructing the reader both touch the file (header checks,
        // footer reads), so they run off-thread like every batch parse.
        let raw = ctx
            .retry
            .run("open", cancel, || {
                let store = Arc::clone(&ctx.store);
                let path = job.path.clone();
                async move { run_blocking(move || store.open(&path)).await }
            })
            .await
            .map_err(|e| retry_failure(LoadErrorKind::StoreUnavailable, e))?;
        let mut reader = {
            let readers = Arc::clone(&ctx.readers);
            let source = self.source.clone();
            let batch_size = ctx.config.batch_size;
            run_blocking(move || {
                let stream = maybe_gunzip(raw, gzip);
                readers.open(&source, stream, batch_size)
            })
            .await
            .map_err(|e| LoadFailure::new(e.kind(), e.to_string()))?
        };

        let mut validator = RowValidator::new(self.source)?;
        let mut writer = StageWriter::new(
            &ctx.db,
            self.source,
            &stage,
            id,
            ctx.config.batch_size,
            &ctx.retry,
            cancel,
        );
        loop {
            cancel.checkpoint()?;
            // Hand the reader to the blocking pool for one batch and
            // take it back with the result.
            let (returned, batch) = run_blocking(move || {
                let mut reader = reader;
                let batch = reader.next_batch();
                (reader, batch)
            })
            .await;
            reader = returned;
            let batch = batch.map_err(|e| LoadFailure::new(e.kind(), e.to_string()))?;
            let Some(batch) = batch else { break };
            writer.push(validator.validate_batch(batch)).await?;
        }
        let (rows_valid, rows_invalid) = writer.finish().await?;
        state.counts.rows_read = validator.rows_read;
        state.counts.rows_valid = rows_valid;
        state.counts.rows_invalid = rows_invalid;

        // In-file grain repeats fail grain validation outright; the
        // threshold never excuses them.
        if validator.grain_duplicates > 0 {
            let key = validator.first_duplicate_key.as_deref().unwrap_or("?");
            return Err(LoadFailure::new(
                LoadErrorKind::GrainValidationError,
                format!(
                    "{} duplicate grain rows within the file (first key '{}')",
                    validator.grain_duplicates, key
                ),
            ));
        }

        if validator.threshold_exceeded() {
            return Err(LoadFailure::new(
                LoadErrorKind::ValidationThresholdExceeded,
                format!(
                    "{} invalid rows exceed threshold {}",
                    validator.invalid_count, self.source.error_threshold
                ),
            ));
        }

        // 6. Audits, read-only against the stage.
        run_audits(&ctx.db, self.source, &stage, &ctx.retry, cancel).await?;

        // 7. Publish. Single attempt.
        let outcome = publish::publish(&ctx.db, self.source, &stage, cancel).await?;
        state.counts.rows_published = outcome.rows_published;

        Ok(())
    }

    async fn close_success(
        &self,
        job: &FileJob,
        filename: &str,
        state: &mut RunState,
    ) -> FileOutcome {
        let ctx = self.ctx;
        if let Some(id) = state.file_load_id {
            let result = ctx
                .retry
                .run("finish_load", &ctx.cancel, || {
                    ctx.db
                        .finish_load(id, LoadState::Succeeded, state.counts, None, None)
                })
                .await;
            match result {
                Ok(()) | Err(RetryError::Cancelled) => {}
                Err(e) => {
                    self.report_cleanup_error(filename, "finish_load", &e.to_string())
                        .await;
                }
            }
        }

        self.drop_stage(filename, state).await;

        // The drop copy is deleted only after a successful publish.
        let store = Arc::clone(&ctx.store);
        let path = job.path.clone();
        if let Err(e) = run_blocking(move || store.delete(&path)).await {
            self.report_cleanup_error(filename, "delete_source", &e.to_string())
                .await;
        }

        FileOutcome {
            path: job.path.clone(),
            filename: filename.to_string(),
            source_name: self.source.name.clone(),
            file_load_id: state.file_load_id,
            state: LoadState::Succeeded,
            failure: None,
            counts: state.counts,
        }
    }

    async fn close_failure(
        &self,
        job: &FileJob,
        filename: &str,
        mut state: RunState,
        failure: LoadFailure,
    ) -> FileOutcome {
        let ctx = self.ctx;
        let terminal = if failure.kind == LoadErrorKind::Cancelled {
            LoadState::Cancelled
        } else {
            LoadState::Failed
        };

        if let Some(id) = state.file_load_id {
            let kind = (failure.kind != LoadErrorKind::Cancelled).then_some(failure.kind);
            if let Err(e) = ctx
                .db
                .finish_load(id, terminal, state.counts, kind, Some(&failure.detail))
                .await
            {
                self.report_cleanup_error(filename, "finish_load", &e.to_string())
                    .await;
            }
        }

        self.drop_stage(filename, &mut state).await;

        // Duplicates park beside other duplicates; everything else is
        // quarantined for inspection and reprocessing.
        let destination = if failure.kind.is_duplicate() {
            ctx.config.duplicates_dir.path.clone()
        } else {
            ctx.config.quarantine_dir.path.clone()
        };
        let store = Arc::clone(&ctx.store);
        let path = job.path.clone();
        if let Err(e) = run_blocking(move || store.move_into(&path, &destination)).await {
            self.report_cleanup_error(filename, "move_source", &e.to_string())
                .await;
        }

        self.notify_failure(filename, state.file_load_id, &failure, state.counts)
            .await;

        FileOutcome {
            path: job.path.clone(),
            filename: filename.to_string(),
            source_name: self.source.name.clone(),
            file_load_id: state.file_load_id,
            state: terminal,
            failure: Some(failure),
            counts: state.counts,
        }
    }

    async fn drop_stage(&self, filename: &str, state: &mut RunState) {
        if let Some(stage) = state.stage.take() {
            if let Err(e) = self.ctx.db.drop_stage_table(&stage).await {
                self.report_cleanup_error(filename, "drop_stage", &e.to_string())
                    .await;
            }
        }
    }

    /// Cleanup faults are reported but never mask the pipeline outcome.
    async fn report_cleanup_error(&self, filename: &str, step: &str, detail: &str) {
        error!(file = filename, step, detail, "cleanup error");
        let payload = serde_json::json!({
            "event": "cleanup_error",
            "source": self.source.name,
            "filename": filename,
            "step": step,
            "detail": detail,
        });
        if let Err(e) = self.ctx.notifier.webhook(&payload).await {
            error!(error = %e, "failed to deliver cleanup webhook");
        }
    }

    async fn notify_failure(
        &self,
        filename: &str,
        file_load_id: Option<FileLoadId>,
        failure: &LoadFailure,
        counts: LoadCounts,
    ) {
        match failure.kind.audience() {
            Audience::Stakeholder => {
                let recipients = self.effective_recipients(failure.kind);
                if recipients.is_empty() {
                    return;
                }
                let mut body = format!(
                    "Source: {}\nFile: {}\nFailure: {}\nDetail: {}\nRows read: {}\nRows valid: {}\nRows invalid: {}\n",
                    self.source.name,
                    filename,
                    failure.kind.as_str(),
                    failure.detail,
                    counts.rows_read,
                    counts.rows_valid,
                    counts.rows_invalid,
                );
                if let Some(id) = file_load_id {
                    match self.ctx.db.dlq_reason_sample(id, 50).await {
                        Ok(sample) if !sample.is_empty() => {
                            body.push_str("\nValidation errors (first 50):\n");
                            for line in sample {
                                body.push_str("  - ");
                                body.push_str(&line);
                                body.push('\n');
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "could not fetch dlq sample for email"),
                    }
                }
                let message = EmailMessage {
                    recipients,
                    cc: self.source.notify.cc.clone(),
                    subject: format!(
                        "[fileflow] {}: {} ({})",
                        self.source.name,
                        failure.kind.as_str(),
                        filename
                    ),
                    body,
                    attachments: Vec::new(),
                };
                if let Err(e) = self.ctx.notifier.email(&message).await {
                    error!(error = %e, "failed to send stakeholder email");
                }
            }
            Audience::Internal => {
                let payload = serde_json::json!({
                    "event": "file_load_failed",
                    "source": self.source.name,
                    "filename": filename,
                    "file_load_id": file_load_id.map(|id| id.as_i64()),
                    "kind": failure.kind.as_str(),
                    "detail": failure.detail,
                });
                if let Err(e) = self.ctx.notifier.webhook(&payload).await {
                    error!(error = %e, "failed to deliver failure webhook");
                }
            }
            Audience::None => {}
        }
    }

    /// The source's notify list, or the data team fallback.
    fn effective_recipients(&self, kind: LoadErrorKind) -> Vec<String> {
        if self.source.notify.wants(kind) {
            return self.source.notify.recipients.clone();
        }
        if self.source.notify.recipients.is_empty() {
            if let Some(smtp) = &self.ctx.config.smtp {
                if let Some(fallback) = &smtp.data_team_email {
                    return vec![fallback.clone()];
                }
            }
        }
        Vec::new()
    }
}

fn retry_failure<E: std::fmt::Display>(kind: LoadErrorKind, error: RetryError<E>) -> LoadFailure {
    match error {
        RetryError::Cancelled => LoadFailure::cancelled(),
        other => LoadFailure::new(kind, other.to_string()),
    }
}
