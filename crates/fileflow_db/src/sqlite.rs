//! SQLite adapter.
//!
//! Serves local/dev runs and the integration test suite. Dates,
//! timestamps, decimals, and JSON are stored as text (RFC 3339 /
//! canonical string forms), matching the dialect's stage DDL.

use crate::adapter::{DbAdapter, DlqRow, LoadLogRow, PublishOutcome};
use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::Utc;
use fileflow_protocol::{FieldSchema, FieldValue, FileLoadId, LoadCounts, LoadErrorKind, LoadState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

// Stay under SQLITE_MAX_VARIABLE_NUMBER with headroom.
const MAX_BIND_PARAMS: usize = 30_000;

/// SQLite-backed [`DbAdapter`].
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Open (and create when missing) the database behind a
    /// `sqlite:` URL.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(DbError::Sqlx)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn bind_value<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        value: &'q FieldValue,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match value {
            FieldValue::Null => query.bind(None::<String>),
            FieldValue::Integer(v) => query.bind(*v),
            FieldValue::Float(v) => query.bind(*v),
            FieldValue::Decimal(v) => query.bind(v.to_string()),
            FieldValue::Boolean(v) => query.bind(*v),
            FieldValue::Text(v) => query.bind(v.as_str()),
            FieldValue::Date(v) => query.bind(v.format("%Y-%m-%d").to_string()),
            FieldValue::Timestamp(v) => query.bind(v.to_rfc3339()),
            FieldValue::Json(v) => query.bind(v.to_string()),
        }
    }

    fn decode_scalar(row: &SqliteRow) -> Option<f64> {
        if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
            return value.map(|v| v as f64);
        }
        if let Ok(value) = row.try_get::<Option<f64>, _>(0) {
            return value;
        }
        row.try_get::<Option<String>, _>(0)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<f64>().ok())
    }
}

#[async_trait]
impl DbAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn ensure_control_tables(&self) -> Result<()> {
        let dialect = self.dialect();
        for sql in dialect
            .create_log_table_sql()
            .into_iter()
            .chain(dialect.create_dlq_table_sql())
        {
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn begin_load(&self, source_name: &str, filename: &str) -> Result<FileLoadId> {
        let result = sqlx::query(
            r#"
            INSERT INTO file_load_log (source_name, filename, started_at, state)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(source_name)
        .bind(filename)
        .bind(Utc::now().to_rfc3339())
        .bind(LoadState::Running.as_str())
        .execute(&self.pool)
        .await?;
        let id = FileLoadId::new(result.last_insert_rowid());
        debug!(source = source_name, filename, %id, "opened load log row");
        Ok(id)
    }

    async fn set_content_hash(&self, id: FileLoadId, content_hash: &str) -> Result<()> {
        sqlx::query("UPDATE file_load_log SET content_hash = ? WHERE file_load_id = ?")
            .bind(content_hash)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_duplicate(
        &self,
        id: FileLoadId,
        filename: &str,
        content_hash: &str,
    ) -> Result<Option<FileLoadId>> {
        let prior: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT file_load_id FROM file_load_log
            WHERE filename = ? AND content_hash = ? AND state = ? AND file_load_id != ?
            ORDER BY file_load_id ASC
            LIMIT 1
            "#,
        )
        .bind(filename)
        .bind(content_hash)
        .bind(LoadState::Succeeded.as_str())
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(prior.map(FileLoadId::new))
    }

    async fn finish_load(
        &self,
        id: FileLoadId,
        state: LoadState,
        counts: LoadCounts,
        error_kind: Option<LoadErrorKind>,
        error_detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE file_load_log
            SET ended_at = ?, state = ?,
                rows_read = ?, rows_valid = ?, rows_invalid = ?, rows_published = ?,
                error_kind = ?, error_detail = ?
            WHERE file_load_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(state.as_str())
        .bind(counts.rows_read as i64)
        .bind(counts.rows_valid as i64)
        .bind(counts.rows_invalid as i64)
        .bind(counts.rows_published as i64)
        .bind(error_kind.map(|k| k.as_str()))
        .bind(error_detail)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_load(&self, id: FileLoadId) -> Result<LoadLogRow> {
        let row = sqlx::query(
            r#"
            SELECT source_name, filename, content_hash, state,
                   rows_read, rows_valid, rows_invalid, rows_published,
                   error_kind, error_detail
            FROM file_load_log WHERE file_load_id = ?
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found(format!("file_load_id {}", id)))?;

        let state: String = row.try_get("state")?;
        Ok(LoadLogRow {
            file_load_id: id,
            source_name: row.try_get("source_name")?,
            filename: row.try_get("filename")?,
            content_hash: row.try_get("content_hash")?,
            state: state.parse().map_err(DbError::invalid_state)?,
            counts: LoadCounts {
                rows_read: row.try_get::<i64, _>("rows_read")? as u64,
                rows_valid: row.try_get::<i64, _>("rows_valid")? as u64,
                rows_invalid: row.try_get::<i64, _>("rows_invalid")? as u64,
                rows_published: row.try_get::<i64, _>("rows_published")? as u64,
            },
            error_kind: row.try_get("error_kind")?,
            error_detail: row.try_get("error_detail")?,
        })
    }

    async fn create_stage_table(
        &self,
        stage: &str,
        fields: &[FieldSchema],
        grain: &[String],
    ) -> Result<()> {
        let dialect = self.dialect();
        sqlx::query(&dialect.create_stage_table_sql(stage, fields))
            .execute(&self.pool)
            .await?;
        sqlx::query(&dialect.create_grain_index_sql(stage, grain))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_stage_table(&self, stage: &str) -> Result<()> {
        sqlx::query(&self.dialect().drop_table_sql(stage))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bulk_insert(
        &self,
        table: &str,
        fields: &[FieldSchema],
        rows: &[Vec<FieldValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let columns: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        let rows_per_stmt = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_stmt) {
            let sql = self.dialect().insert_sql(table, &columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for value in row {
                    query = Self::bind_value(query, value);
                }
            }
            inserted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn insert_dlq_rows(&self, rows: &[DlqRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        // 8 columns per row.
        let rows_per_stmt = (MAX_BIND_PARAMS / 8).max(1);
        let mut inserted = 0u64;
        for chunk in rows.chunks(rows_per_stmt) {
            let sql = self.dialect().dlq_insert_sql(chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                query = query
                    .bind(row.file_load_id.as_i64())
                    .bind(row.source_name.as_str())
                    .bind(row.source_row_number as i64)
                    .bind(row.grain_key.as_deref())
                    .bind(serde_json::to_string(&row.failed_fields)?)
                    .bind(serde_json::to_string(&row.reasons)?)
                    .bind(row.original_row_json.as_str())
                    .bind(row.created_at.to_rfc3339());
            }
            inserted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn dlq_reason_sample(&self, id: FileLoadId, limit: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT source_row_number, reasons FROM file_load_dlq
            WHERE file_load_id = ?
            ORDER BY source_row_number ASC
            LIMIT ?
            "#,
        )
        .bind(id.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut sample = Vec::with_capacity(rows.len());
        for row in rows {
            let row_number: i64 = row.try_get("source_row_number")?;
            let raw: String = row.try_get("reasons")?;
            let reasons: Vec<String> = serde_json::from_str(&raw).unwrap_or_else(|_| vec![raw]);
            sample.push(format!("row {}: {}", row_number, reasons.join("; ")));
        }
        Ok(sample)
    }

    async fn dlq_count(&self, source_name: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_load_dlq WHERE source_name = ?")
                .bind(source_name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn execute_scalar(&self, sql: &str) -> Result<Option<f64>> {
        let row = sqlx::query(sql).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().and_then(Self::decode_scalar))
    }

    async fn first_duplicate_grain(&self, stage: &str, grain: &[String]) -> Result<Option<String>> {
        let sql = self.dialect().grain_duplicate_sql(stage, grain);
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("grain_key")?)),
            None => Ok(None),
        }
    }

    async fn publish(
        &self,
        stage: &str,
        target: &str,
        fields: &[FieldSchema],
        grain: &[String],
        source_name: &str,
    ) -> Result<PublishOutcome> {
        let dialect = self.dialect();
        let merge = dialect.merge_sql(stage, target, fields, grain);
        let heal = dialect.dlq_heal_sql(target, grain);

        let mut tx = self.pool.begin().await?;
        let rows_published = sqlx::query(&merge).execute(&mut *tx).await?.rows_affected();
        let dlq_cleared = sqlx::query(&heal)
            .bind(source_name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(stage, target, rows_published, dlq_cleared, "published stage");
        Ok(PublishOutcome {
            rows_published,
            dlq_cleared,
        })
    }
}

/// Helpers for tests that need a target table to merge into.
impl SqliteAdapter {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the target table for a source, as deployment tooling
    /// would: stage schema plus a unique grain constraint.
    pub async fn create_target_table(
        &self,
        target: &str,
        fields: &[FieldSchema],
        grain: &[String],
    ) -> Result<()> {
        let dialect = self.dialect();
        let columns: Vec<String> = fields
            .iter()
            .map(|f| {
                format!(
                    "{} {}{}",
                    dialect.quote(&f.name),
                    dialect.sql_type(f.field_type),
                    if f.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        let unique: Vec<String> = grain.iter().map(|g| dialect.quote(g)).collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE ({}))",
            dialect.quote(target),
            columns.join(", "),
            unique.join(", ")
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }
}
