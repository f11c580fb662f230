//! Read-only guard for user-supplied audit SQL.
//!
//! Audits run against the stage table and must not mutate anything.

use thiserror::Error;

const ALLOWED_PREFIXES: &[&str] = &["SELECT", "WITH"];
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "MERGE", "GRANT",
    "ATTACH", "COPY",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SqlGuardError {
    message: String,
}

impl SqlGuardError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Validate that an audit query is a single read-only statement.
pub fn validate_audit_sql(sql: &str) -> Result<(), SqlGuardError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlGuardError::new("audit query is empty"));
    }
    if trimmed.contains(';') {
        return Err(SqlGuardError::new(
            "audit query must be a single statement",
        ));
    }

    let tokens: Vec<String> = trimmed
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_uppercase())
        .collect();

    match tokens.first() {
        Some(first) if ALLOWED_PREFIXES.contains(&first.as_str()) => {}
        _ => {
            return Err(SqlGuardError::new(
                "audit query must start with SELECT or WITH",
            ))
        }
    }

    for token in &tokens {
        if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
            return Err(SqlGuardError::new(format!(
                "audit query contains forbidden keyword: {}",
                token
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_passes() {
        assert!(validate_audit_sql("SELECT COUNT(*) FROM {stage}").is_ok());
        assert!(validate_audit_sql("  with x as (select 1) select * from x ").is_ok());
    }

    #[test]
    fn mutations_fail() {
        assert!(validate_audit_sql("DELETE FROM {stage}").is_err());
        assert!(validate_audit_sql("SELECT 1; DROP TABLE t").is_err());
        assert!(validate_audit_sql("SELECT * FROM t WHERE x IN (SELECT 1); UPDATE t SET x=1").is_err());
    }

    #[test]
    fn empty_fails() {
        assert!(validate_audit_sql("  ;").is_err());
    }
}
