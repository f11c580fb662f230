//! Dispatch: match discovered files to sources and run a bounded
//! worker pool.
//!
//! W long-lived workers pull matched jobs from a bounded channel; each
//! runs exactly one PipelineRunner to completion before pulling the
//! next. A panicking pipeline is confined to its own task: the worker
//! records a `WorkerPanic`, posts a webhook, and keeps consuming.

use crate::blocking::run_blocking;
use crate::discover::FileJob;
use crate::failure::LoadFailure;
use crate::runner::{FileOutcome, PipelineContext, PipelineRunner};
use fileflow_protocol::{LoadCounts, LoadErrorKind, LoadState, SourceRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Aggregate result of one process invocation.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub files_discovered: usize,
    pub unmatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub internal_errors: usize,
    pub outcomes: Vec<FileOutcome>,
}

impl RunSummary {
    /// Per-file failures are not process failures; internal faults are.
    pub fn exit_code(&self) -> i32 {
        if self.internal_errors > 0 {
            1
        } else {
            0
        }
    }

    fn absorb(&mut self, outcome: FileOutcome) {
        match outcome.state {
            LoadState::Succeeded => self.succeeded += 1,
            LoadState::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
        if outcome.is_internal_error() {
            self.internal_errors += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Matches jobs to sources and fans them out to W workers.
pub struct Dispatcher {
    ctx: Arc<PipelineContext>,
    registry: Arc<SourceRegistry>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<PipelineContext>, registry: Arc<SourceRegistry>) -> Self {
        Self { ctx, registry }
    }

    pub async fn run(&self, jobs: Vec<FileJob>) -> RunSummary {
        let mut summary = RunSummary {
            files_discovered: jobs.len(),
            ..Default::default()
        };

        // First-match-wins source selection; unmatched files leave the
        // drop directory immediately, with no database state.
        let mut matched = Vec::new();
        for job in jobs {
            match source_index(&self.registry, job.file_name()) {
                Some(index) => matched.push((job, index)),
                None => {
                    warn!(file = %job.file_name(), "no source matches; moving to duplicates");
                    summary.unmatched += 1;
                    let store = Arc::clone(&self.ctx.store);
                    let path = job.path.clone();
                    let duplicates = self.ctx.config.duplicates_dir.path.clone();
                    if let Err(e) =
                        run_blocking(move || store.move_into(&path, &duplicates)).await
                    {
                        error!(file = %job.file_name(), error = %e, "failed to move unmatched file");
                    }
                }
            }
        }

        let worker_count = self.ctx.config.worker_count.max(1);
        info!(
            files = matched.len(),
            workers = worker_count,
            "dispatching matched files"
        );

        let (tx, rx) = mpsc::channel::<(FileJob, usize)>(worker_count * 2);
        let rx = Arc::new(Mutex::new(rx));

        let workers: Vec<_> = (0..worker_count)
            .map(|worker_id| {
                let ctx = Arc::clone(&self.ctx);
                let registry = Arc::clone(&self.registry);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    let mut outcomes = Vec::new();
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some((job, source_index)) = next else { break };
                        outcomes.push(run_isolated(&ctx, &registry, job, source_index, worker_id).await);
                    }
                    outcomes
                })
            })
            .collect();

        for item in matched {
            if tx.send(item).await.is_err() {
                break;
            }
        }
        drop(tx);

        for worker in workers {
            match worker.await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        summary.absorb(outcome);
                    }
                }
                Err(e) => {
                    // A worker loop itself never panics; a join error here
                    // is a runtime fault.
                    error!(error = %e, "worker join failed");
                    summary.internal_errors += 1;
                }
            }
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            unmatched = summary.unmatched,
            internal_errors = summary.internal_errors,
            "run complete"
        );
        summary
    }
}

fn source_index(registry: &SourceRegistry, filename: &str) -> Option<usize> {
    registry.sources.iter().position(|s| s.matches(filename))
}

/// Run one file's pipeline in its own task so a panic cannot take the
/// worker down with it.
async fn run_isolated(
    ctx: &Arc<PipelineContext>,
    registry: &Arc<SourceRegistry>,
    job: FileJob,
    source_index: usize,
    worker_id: usize,
) -> FileOutcome {
    let task_ctx = Arc::clone(ctx);
    let task_registry = Arc::clone(registry);
    let task_job = job.clone();
    let handle = tokio::spawn(async move {
        let source = &task_registry.sources[source_index];
        PipelineRunner::new(&task_ctx, source).run(&task_job).await
    });

    match handle.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            let detail = if join_error.is_panic() {
                format!("worker {} panicked while processing file", worker_id)
            } else {
                format!("worker {} task aborted", worker_id)
            };
            error!(file = %job.file_name(), detail, "pipeline task died");

            let payload = serde_json::json!({
                "event": "worker_panic",
                "worker": worker_id,
                "source": registry.sources[source_index].name,
                "filename": job.file_name(),
                "detail": detail,
            });
            if let Err(e) = ctx.notifier.webhook(&payload).await {
                error!(error = %e, "failed to deliver panic webhook");
            }

            // The file stays in the drop directory for the next run.
            if !job.path.exists() {
                warn!(file = %job.file_name(), "file missing after panic; cannot requeue");
            }

            FileOutcome {
                filename: job.file_name().to_string(),
                source_name: registry.sources[source_index].name.clone(),
                path: job.path,
                file_load_id: None,
                state: LoadState::Failed,
                failure: Some(LoadFailure::new(LoadErrorKind::WorkerPanic, detail)),
                counts: LoadCounts::default(),
            }
        }
    }
}
