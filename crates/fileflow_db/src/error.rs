//! Error types for the database layer.

use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file-backed databases)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition or unexpected shape
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Driver for the URL scheme is not compiled in
    #[error("no driver for '{0}' is built in")]
    Unsupported(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Deadlock / serialization-failure SQLSTATEs across engines.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "1213", "1205"];

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Transient errors (timeouts, broken connections, deadlocks) are
    /// retried by the pipeline within its backoff budget.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Io(_))
            | DbError::Sqlx(sqlx::Error::PoolTimedOut)
            | DbError::Sqlx(sqlx::Error::WorkerCrashed) => true,
            DbError::Sqlx(sqlx::Error::Database(db)) => db
                .code()
                .map(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref()))
                .unwrap_or(false),
            DbError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
