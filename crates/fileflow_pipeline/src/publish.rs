//! Atomic publish: merge the stage into the target by grain and clear
//! healed DLQ rows, in one adapter transaction.
//!
//! The merge is deliberately not retried past its first attempt: a
//! failed merge leaves the target's prior state in place and the file
//! quarantined for reprocessing.

use crate::failure::{CancellationToken, LoadFailure};
use fileflow_db::{DbAdapter, PublishOutcome};
use fileflow_protocol::{LoadErrorKind, SourceConfig};
use std::sync::Arc;
use tracing::info;

pub async fn publish(
    db: &Arc<dyn DbAdapter>,
    source: &SourceConfig,
    stage: &str,
    cancel: &CancellationToken,
) -> Result<PublishOutcome, LoadFailure> {
    cancel.checkpoint()?;
    let outcome = db
        .publish(
            stage,
            &source.target_table,
            &source.fields,
            &source.grain,
            &source.name,
        )
        .await
        .map_err(|e| LoadFailure::new(LoadErrorKind::PublishFailed, e.to_string()))?;
    info!(
        source = %source.name,
        target = %source.target_table,
        rows = outcome.rows_published,
        dlq_cleared = outcome.dlq_cleared,
        "published stage to target"
    );
    Ok(outcome)
}
