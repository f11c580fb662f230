//! Post-write audits on the stage table.
//!
//! Grain uniqueness first, then the source's user audits in declared
//! order. Audits are read-only; the SQL guard rejects anything else.

use crate::failure::CancellationToken;
use crate::failure::LoadFailure;
use crate::retry::{RetryError, RetryPolicy};
use fileflow_db::{validate_audit_sql, DbAdapter};
use fileflow_protocol::{LoadErrorKind, SourceConfig};
use std::sync::Arc;
use tracing::info;

pub async fn run_audits(
    db: &Arc<dyn DbAdapter>,
    source: &SourceConfig,
    stage: &str,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), LoadFailure> {
    let duplicate = retry
        .run("grain_audit", cancel, || {
            db.first_duplicate_grain(stage, &source.grain)
        })
        .await
        .map_err(audit_infra_failure)?;
    if let Some(key) = duplicate {
        return Err(LoadFailure::new(
            LoadErrorKind::GrainValidationError,
            format!("grain key '{}' appears more than once on stage", key),
        ));
    }

    for audit in &source.audits {
        validate_audit_sql(&audit.sql).map_err(|e| {
            LoadFailure::new(
                LoadErrorKind::AuditFailedError,
                format!("audit '{}' rejected: {}", audit.name, e),
            )
        })?;
        let sql = audit
            .sql
            .replace("{stage}", &db.dialect().quote(stage));

        let observed = retry
            .run("user_audit", cancel, || db.execute_scalar(&sql))
            .await
            .map_err(audit_infra_failure)?;

        match observed {
            Some(value) if audit.predicate.holds(value) => {
                info!(audit = %audit.name, observed = value, "audit passed");
            }
            Some(value) => {
                return Err(LoadFailure::new(
                    LoadErrorKind::AuditFailedError,
                    format!(
                        "audit '{}' failed: observed {} but requires {}",
                        audit.name, value, audit.predicate
                    ),
                ));
            }
            None => {
                return Err(LoadFailure::new(
                    LoadErrorKind::AuditFailedError,
                    format!(
                        "audit '{}' failed: observed NULL but requires {}",
                        audit.name, audit.predicate
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn audit_infra_failure(error: RetryError<fileflow_db::DbError>) -> LoadFailure {
    match error {
        RetryError::Cancelled => LoadFailure::cancelled(),
        other => LoadFailure::new(LoadErrorKind::DbUnavailable, format!("audit query: {}", other)),
    }
}
