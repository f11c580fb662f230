//! Database layer for Fileflow.
//!
//! One [`DbAdapter`] per process, selected by the `DATABASE_URL`
//! scheme. Engine differences live in [`Dialect`] (SQL text) and in the
//! adapter implementations (binding, id allocation); the pipeline never
//! sees either.
//!
//! # Example
//!
//! ```rust,ignore
//! let adapter = fileflow_db::connect("sqlite:/tmp/loader.db", 6).await?;
//! adapter.ensure_control_tables().await?;
//! let id = adapter.begin_load("customers", "customers_2024.csv").await?;
//! ```

pub mod adapter;
pub mod dialect;
pub mod error;
pub mod guard;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use adapter::{DbAdapter, DlqRow, LoadLogRow, PublishOutcome};
pub use dialect::{Dialect, FILE_LOAD_DLQ, FILE_LOAD_LOG};
pub use error::{DbError, Result};
pub use guard::{validate_audit_sql, SqlGuardError};
#[cfg(feature = "postgres")]
pub use postgres::PgAdapter;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAdapter;

use std::sync::Arc;

/// Connect the adapter selected by the URL scheme.
///
/// `max_connections` should be at least worker count + 2 so pipeline
/// workers never starve the control-table writes.
pub async fn connect(url: &str, max_connections: u32) -> Result<Arc<dyn DbAdapter>> {
    let dialect = Dialect::from_url(url)
        .ok_or_else(|| DbError::Unsupported(url.split(':').next().unwrap_or(url).to_string()))?;
    match dialect {
        #[cfg(feature = "sqlite")]
        Dialect::Sqlite => Ok(Arc::new(
            SqliteAdapter::connect(url, max_connections).await?,
        )),
        #[cfg(feature = "postgres")]
        Dialect::Postgres => Ok(Arc::new(PgAdapter::connect(url, max_connections).await?)),
        // Dialect SQL for these engines ships; driver integration is a
        // separate concern (tiberius / BigQuery client).
        other => Err(DbError::Unsupported(other.name().to_string())),
    }
}
