//! PostgreSQL adapter.

use crate::adapter::{DbAdapter, DlqRow, LoadLogRow, PublishOutcome};
use crate::dialect::Dialect;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fileflow_protocol::{
    FieldSchema, FieldValue, FileLoadId, LoadCounts, LoadErrorKind, LoadState, SemanticType,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;

// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 60_000;

/// PostgreSQL-backed [`DbAdapter`].
pub struct PgAdapter {
    pool: PgPool,
}

impl PgAdapter {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bind a typed value. Nulls are bound with the column's driver
    /// type so the extended protocol can type the parameter.
    fn bind_value<'q>(
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
        value: &'q FieldValue,
        semantic: SemanticType,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match value {
            FieldValue::Null => match semantic {
                SemanticType::Integer => query.bind(None::<i64>),
                SemanticType::Float => query.bind(None::<f64>),
                SemanticType::Decimal => query.bind(None::<Decimal>),
                SemanticType::Boolean => query.bind(None::<bool>),
                SemanticType::Text => query.bind(None::<String>),
                SemanticType::Date => query.bind(None::<NaiveDate>),
                SemanticType::Timestamp => query.bind(None::<DateTime<Utc>>),
                SemanticType::Json => query.bind(None::<serde_json::Value>),
            },
            FieldValue::Integer(v) => query.bind(*v),
            FieldValue::Float(v) => query.bind(*v),
            FieldValue::Decimal(v) => query.bind(*v),
            FieldValue::Boolean(v) => query.bind(*v),
            FieldValue::Text(v) => query.bind(v.as_str()),
            FieldValue::Date(v) => query.bind(*v),
            FieldValue::Timestamp(v) => query.bind(*v),
            FieldValue::Json(v) => query.bind(v.clone()),
        }
    }

    fn decode_scalar(row: &PgRow) -> Option<f64> {
        if let Ok(value) = row.try_get::<Option<i64>, _>(0) {
            return value.map(|v| v as f64);
        }
        if let Ok(value) = row.try_get::<Option<f64>, _>(0) {
            return value;
        }
        if let Ok(value) = row.try_get::<Option<Decimal>, _>(0) {
            return value.and_then(|v| v.to_f64());
        }
        row.try_get::<Option<String>, _>(0)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<f64>().ok())
    }
}

#[async_trait]
impl DbAdapter for PgAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO file_load_log (source_name, filename, started_at, state)
            VALUES ($1, $2, $3, $4)
            RETURNING file_load_id
            "#,
        )
        .bind(source_name)
        .bind(filename)
        .bind(Utc::now())
        .bind(LoadState::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        let id = FileLoadId::new(id);
        debug!(source = source_name, filename, %id, "opened load log row");
        Ok(id)
    }

    async fn set_content_hash(&self, id: FileLoadId, content_hash: &str) -> Result<()> {
        sqlx::query("UPDATE file_load_log SET content_hash = $1 WHERE file_load_id = $2")
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
            WHERE filename = $1 AND content_hash = $2 AND state = $3 AND file_load_id != $4
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
            SET ended_at = $1, state = $2,
                rows_read = $3, rows_valid = $4, rows_invalid = $5, rows_published = $6,
                error_kind = $7, error_detail = $8
            WHERE file_load_id = $9
            "#,
        )
        .bind(Utc::now())
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
            FROM file_load_log WHERE file_load_id = $1
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
                for (value, field) in row.iter().zip(fields) {
                    query = Self::bind_value(query, value, field.field_type);
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
                    .bind(row.created_at);
            }
            inserted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn dlq_reason_sample(&self, id: FileLoadId, limit: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT source_row_number, reasons FROM file_load_dlq
            WHERE file_load_id = $1
            ORDER BY source_row_number ASC
            LIMIT $2
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
            sqlx::query_scalar("SELECT COUNT(*) FROM file_load_dlq WHERE source_name = $1")
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
