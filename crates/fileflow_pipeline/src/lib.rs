//! The per-file pipeline engine.
//!
//! Discovery snapshots the drop directory; the Dispatcher matches each
//! file to its source configuration and fans the work out to W
//! workers; each worker drives one PipelineRunner at a time through
//! archive, dedup, stage, read/validate/write, audit, publish, and the
//! guaranteed cleanup path.

pub mod audit;
mod blocking;
pub mod discover;
pub mod dispatch;
pub mod failure;
pub mod publish;
pub mod retry;
pub mod runner;
pub mod validate;
pub mod write;

pub use discover::{snapshot, FileJob};
pub use dispatch::{Dispatcher, RunSummary};
pub use failure::{CancellationToken, LoadFailure};
pub use retry::{RetryError, RetryPolicy, Transient};
pub use runner::{FileOutcome, PipelineContext, PipelineRunner};
pub use validate::{RowValidator, RowFailure, TypedRow, ValidatedBatch};
pub use write::StageWriter;
