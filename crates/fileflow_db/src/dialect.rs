//! SQL dialect builders.
//!
//! Everything engine-specific that can be expressed as SQL text lives
//! here, so the orchestration code stays adapter-agnostic: identifier
//! quoting, type mapping, stage DDL, multi-row inserts, the grain
//! duplicate probe, the merge statement, and the DLQ healing delete.

use fileflow_protocol::{FieldSchema, SemanticType};
use std::fmt;
use std::str::FromStr;

/// Target engine families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Postgres,
    MySql,
    SqlServer,
    BigQuery,
    Sqlite,
}

impl Dialect {
    /// Select a dialect from a database URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?;
        match scheme {
            "postgresql" | "postgres" => Some(Dialect::Postgres),
            "mysql" => Some(Dialect::MySql),
            "mssql" | "sqlserver" => Some(Dialect::SqlServer),
            "bigquery" => Some(Dialect::BigQuery),
            "sqlite" => Some(Dialect::Sqlite),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::SqlServer => "sqlserver",
            Dialect::BigQuery => "bigquery",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Quote an identifier. Inputs are validated identifiers already;
    /// quoting guards against keyword collisions, not injection.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", ident),
            Dialect::MySql | Dialect::BigQuery => format!("`{}`", ident),
            Dialect::SqlServer => format!("[{}]", ident),
        }
    }

    /// Bind-parameter placeholder for 1-based position `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::SqlServer => format!("@p{}", n),
            Dialect::MySql | Dialect::BigQuery | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Column type for a semantic field type.
    pub fn sql_type(&self, semantic: SemanticType) -> &'static str {
        use SemanticType::*;
        match self {
            Dialect::Postgres => match semantic {
                Integer => "BIGINT",
                Float => "DOUBLE PRECISION",
                Decimal => "NUMERIC(38, 9)",
                Boolean => "BOOLEAN",
                Text => "TEXT",
                Date => "DATE",
                Timestamp => "TIMESTAMPTZ",
                Json => "JSONB",
            },
            Dialect::MySql => match semantic {
                Integer => "BIGINT",
                Float => "DOUBLE",
                Decimal => "DECIMAL(38, 9)",
                Boolean => "BOOLEAN",
                Text => "TEXT",
                Date => "DATE",
                Timestamp => "DATETIME(6)",
                Json => "JSON",
            },
            Dialect::SqlServer => match semantic {
                Integer => "BIGINT",
                Float => "FLOAT",
                Decimal => "DECIMAL(38, 9)",
                Boolean => "BIT",
                Text => "NVARCHAR(MAX)",
                Date => "DATE",
                Timestamp => "DATETIME2",
                Json => "NVARCHAR(MAX)",
            },
            Dialect::BigQuery => match semantic {
                Integer => "INT64",
                Float => "FLOAT64",
                Decimal => "BIGNUMERIC",
                Boolean => "BOOL",
                Text => "STRING",
                Date => "DATE",
                Timestamp => "TIMESTAMP",
                Json => "JSON",
            },
            // SQLite affinity is loose; dates and timestamps are kept as
            // RFC 3339 text so grain keys compare bytewise.
            Dialect::Sqlite => match semantic {
                Integer => "INTEGER",
                Float => "REAL",
                Decimal => "TEXT",
                Boolean => "BOOLEAN",
                Text => "TEXT",
                Date => "TEXT",
                Timestamp => "TEXT",
                Json => "TEXT",
            },
        }
    }

    /// Stage table DDL matching the source schema.
    pub fn create_stage_table_sql(&self, stage: &str, fields: &[FieldSchema]) -> String {
        let columns: Vec<String> = fields
            .iter()
            .map(|f| {
                format!(
                    "{} {}{}",
                    self.quote(&f.name),
                    self.sql_type(f.field_type),
                    if f.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        format!(
            "CREATE TABLE {} ({})",
            self.quote(stage),
            columns.join(", ")
        )
    }

    /// Non-unique index on the grain columns of a stage table.
    pub fn create_grain_index_sql(&self, stage: &str, grain: &[String]) -> String {
        let cols: Vec<String> = grain.iter().map(|g| self.quote(g)).collect();
        format!(
            "CREATE INDEX {} ON {} ({})",
            self.quote(&format!("ix_{}_grain", stage)),
            self.quote(stage),
            cols.join(", ")
        )
    }

    pub fn drop_table_sql(&self, table: &str) -> String {
        match self {
            Dialect::SqlServer => format!(
                "IF OBJECT_ID('{0}', 'U') IS NOT NULL DROP TABLE {1}",
                table,
                self.quote(table)
            ),
            _ => format!("DROP TABLE IF EXISTS {}", self.quote(table)),
        }
    }

    /// Multi-row parameterised insert for `row_count` rows.
    pub fn insert_sql(&self, table: &str, columns: &[&str], row_count: usize) -> String {
        let quoted: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
        let mut rows = Vec::with_capacity(row_count);
        let mut n = 1;
        for _ in 0..row_count {
            let mut placeholders = Vec::with_capacity(columns.len());
            for _ in columns {
                placeholders.push(self.placeholder(n));
                n += 1;
            }
            rows.push(format!("({})", placeholders.join(", ")));
        }
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote(table),
            quoted.join(", "),
            rows.join(", ")
        )
    }

    /// Grain key expression: `|`-joined text casts of the grain columns.
    ///
    /// Must agree with `FieldValue::to_key_string` on the Rust side.
    pub fn grain_key_expr(&self, alias: &str, grain: &[String]) -> String {
        let casts: Vec<String> = grain
            .iter()
            .map(|g| {
                let column = format!("{}.{}", alias, self.quote(g));
                match self {
                    Dialect::Postgres => format!("CAST({} AS TEXT)", column),
                    Dialect::Sqlite => format!("CAST({} AS TEXT)", column),
                    Dialect::MySql => format!("CAST({} AS CHAR)", column),
                    Dialect::SqlServer => format!("CAST({} AS NVARCHAR(MAX))", column),
                    Dialect::BigQuery => format!("CAST({} AS STRING)", column),
                }
            })
            .collect();
        match self {
            Dialect::Postgres | Dialect::Sqlite => casts.join(" || '|' || "),
            Dialect::MySql | Dialect::SqlServer | Dialect::BigQuery => {
                format!("CONCAT({})", casts.join(", '|', "))
            }
        }
    }

    /// First duplicated grain tuple on the stage table, if any.
    pub fn grain_duplicate_sql(&self, stage: &str, grain: &[String]) -> String {
        let cols: Vec<String> = grain.iter().map(|g| self.quote(g)).collect();
        let key = self.grain_key_expr("s", grain);
        match self {
            Dialect::SqlServer => format!(
                "SELECT TOP 1 {key} AS grain_key FROM {stage} AS s GROUP BY {cols} HAVING COUNT(*) > 1",
                key = key,
                stage = self.quote(stage),
                cols = cols
                    .iter()
                    .map(|c| format!("s.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            _ => format!(
                "SELECT {key} AS grain_key FROM {stage} AS s GROUP BY {cols} HAVING COUNT(*) > 1 LIMIT 1",
                key = key,
                stage = self.quote(stage),
                cols = cols
                    .iter()
                    .map(|c| format!("s.{}", c))
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
    }

    /// Single-statement merge of stage into target by grain.
    ///
    /// Engines with an upsert clause get one; SQL Server and BigQuery
    /// get a `MERGE`. Targets must carry a unique constraint on the
    /// grain for the upsert forms.
    pub fn merge_sql(
        &self,
        stage: &str,
        target: &str,
        fields: &[FieldSchema],
        grain: &[String],
    ) -> String {
        let columns: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        let quoted: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
        let non_grain: Vec<&str> = columns
            .iter()
            .filter(|c| !grain.iter().any(|g| g == *c))
            .copied()
            .collect();
        let grain_quoted: Vec<String> = grain.iter().map(|g| self.quote(g)).collect();

        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let action = if non_grain.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    let sets: Vec<String> = non_grain
                        .iter()
                        .map(|c| format!("{0} = EXCLUDED.{0}", self.quote(c)))
                        .collect();
                    format!("DO UPDATE SET {}", sets.join(", "))
                };
                format!(
                    "INSERT INTO {target} ({cols}) SELECT {cols} FROM {stage} WHERE TRUE ON CONFLICT ({grain}) {action}",
                    target = self.quote(target),
                    cols = quoted.join(", "),
                    stage = self.quote(stage),
                    grain = grain_quoted.join(", "),
                    action = action,
                )
            }
            Dialect::MySql => {
                if non_grain.is_empty() {
                    format!(
                        "INSERT IGNORE INTO {target} ({cols}) SELECT {cols} FROM {stage}",
                        target = self.quote(target),
                        cols = quoted.join(", "),
                        stage = self.quote(stage),
                    )
                } else {
                    let sets: Vec<String> = non_grain
                        .iter()
                        .map(|c| format!("{0} = new_rows.{0}", self.quote(c)))
                        .collect();
                    format!(
                        "INSERT INTO {target} ({cols}) SELECT * FROM (SELECT {cols} FROM {stage}) AS new_rows ON DUPLICATE KEY UPDATE {sets}",
                        target = self.quote(target),
                        cols = quoted.join(", "),
                        stage = self.quote(stage),
                        sets = sets.join(", "),
                    )
                }
            }
            Dialect::SqlServer | Dialect::BigQuery => {
                let on: Vec<String> = grain_quoted
                    .iter()
                    .map(|g| format!("t.{0} = s.{0}", g))
                    .collect();
                let insert_cols = quoted.join(", ");
                let insert_vals: Vec<String> =
                    quoted.iter().map(|c| format!("s.{}", c)).collect();
                let matched = if non_grain.is_empty() {
                    String::new()
                } else {
                    let sets: Vec<String> = non_grain
                        .iter()
                        .map(|c| format!("t.{0} = s.{0}", self.quote(c)))
                        .collect();
                    format!(" WHEN MATCHED THEN UPDATE SET {}", sets.join(", "))
                };
                format!(
                    "MERGE INTO {target} AS t USING {stage} AS s ON {on}{matched} WHEN NOT MATCHED THEN INSERT ({insert_cols}) VALUES ({insert_vals});",
                    target = self.quote(target),
                    stage = self.quote(stage),
                    on = on.join(" AND "),
                    matched = matched,
                    insert_cols = insert_cols,
                    insert_vals = insert_vals.join(", "),
                )
            }
        }
    }

    /// Delete DLQ rows for a source whose grain now exists in the target
    /// (self-healing after a successful publish). One bind parameter:
    /// the source name.
    pub fn dlq_heal_sql(&self, target: &str, grain: &[String]) -> String {
        format!(
            "DELETE FROM {dlq} WHERE {source_col} = {p} AND {key_col} IN (SELECT {key} FROM {target} AS t)",
            dlq = self.quote(FILE_LOAD_DLQ),
            source_col = self.quote("source_name"),
            p = self.placeholder(1),
            key_col = self.quote("grain_key"),
            key = self.grain_key_expr("t", grain),
            target = self.quote(target),
        )
    }

    /// DDL for the append-only per-file load log.
    pub fn create_log_table_sql(&self) -> Vec<String> {
        let id_column = match self {
            Dialect::Postgres => "file_load_id BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY",
            Dialect::MySql => "file_load_id BIGINT AUTO_INCREMENT PRIMARY KEY",
            Dialect::SqlServer => "file_load_id BIGINT IDENTITY(1,1) PRIMARY KEY",
            // BigQuery has no sequences; ids come from the allocator
            // table (see `allocator_sql`).
            Dialect::BigQuery => "file_load_id INT64 NOT NULL",
            Dialect::Sqlite => "file_load_id INTEGER PRIMARY KEY AUTOINCREMENT",
        };
        let text = self.sql_type(SemanticType::Text);
        let ts = self.sql_type(SemanticType::Timestamp);
        let int = self.sql_type(SemanticType::Integer);
        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {log} ({id}, source_name {text} NOT NULL, filename {text} NOT NULL, content_hash {text}, started_at {ts} NOT NULL, ended_at {ts}, state {text} NOT NULL, rows_read {int} NOT NULL DEFAULT 0, rows_valid {int} NOT NULL DEFAULT 0, rows_invalid {int} NOT NULL DEFAULT 0, rows_published {int} NOT NULL DEFAULT 0, error_kind {text}, error_detail {text})",
            log = self.quote(FILE_LOAD_LOG),
            id = id_column,
            text = text,
            ts = ts,
            int = int,
        )];
        // `CREATE INDEX IF NOT EXISTS` only exists on these engines; the
        // others index via their own migration tooling.
        if matches!(self, Dialect::Postgres | Dialect::Sqlite) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS ix_file_load_log_dedupe ON {} (filename, content_hash, state)",
                self.quote(FILE_LOAD_LOG)
            ));
        }
        statements
    }

    /// DDL for the cross-file dead letter queue.
    pub fn create_dlq_table_sql(&self) -> Vec<String> {
        let text = self.sql_type(SemanticType::Text);
        let ts = self.sql_type(SemanticType::Timestamp);
        let int = self.sql_type(SemanticType::Integer);
        let key_type = match self {
            // TEXT cannot be a key column on these engines.
            Dialect::MySql => "VARCHAR(512)",
            Dialect::SqlServer => "NVARCHAR(450)",
            _ => text,
        };
        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {dlq} (file_load_id {int} NOT NULL, source_name {text} NOT NULL, source_row_number {int} NOT NULL, grain_key {key}, failed_fields {text} NOT NULL, reasons {text} NOT NULL, original_row_json {text} NOT NULL, created_at {ts} NOT NULL, PRIMARY KEY (file_load_id, source_row_number))",
            dlq = self.quote(FILE_LOAD_DLQ),
            int = int,
            text = text,
            key = key_type,
            ts = ts,
        )];
        if matches!(self, Dialect::Postgres | Dialect::Sqlite) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS ix_file_load_dlq_grain ON {} (source_name, grain_key)",
                self.quote(FILE_LOAD_DLQ)
            ));
        }
        statements
    }

    /// Idempotent DLQ insert: retried buffers must not violate the
    /// (file_load_id, source_row_number) primary key.
    pub fn dlq_insert_sql(&self, row_count: usize) -> String {
        let columns = [
            "file_load_id",
            "source_name",
            "source_row_number",
            "grain_key",
            "failed_fields",
            "reasons",
            "original_row_json",
            "created_at",
        ];
        let base = self.insert_sql(FILE_LOAD_DLQ, &columns, row_count);
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!(
                "{} ON CONFLICT (file_load_id, source_row_number) DO NOTHING",
                base
            ),
            Dialect::MySql => base.replacen("INSERT INTO", "INSERT IGNORE INTO", 1),
            // MERGE-style idempotency for these engines is handled by the
            // adapter deleting the load's rows before a retried flush.
            Dialect::SqlServer | Dialect::BigQuery => base,
        }
    }

    /// BigQuery has no sequences: allocate file_load_ids from a
    /// single-row allocator table inside a transaction.
    pub fn allocator_sql(&self) -> Option<Vec<String>> {
        match self {
            Dialect::BigQuery => Some(vec![
                "CREATE TABLE IF NOT EXISTS `file_load_id_alloc` (next_id INT64 NOT NULL)"
                    .to_string(),
                "UPDATE `file_load_id_alloc` SET next_id = next_id + 1 WHERE TRUE".to_string(),
                "SELECT next_id FROM `file_load_id_alloc`".to_string(),
            ]),
            _ => None,
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Dialect::from_url(&format!("{}:", value))
            .ok_or_else(|| format!("unknown dialect '{}'", value))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Control table names.
pub const FILE_LOAD_LOG: &str = "file_load_log";
pub const FILE_LOAD_DLQ: &str = "file_load_dlq";

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<FieldSchema> {
        vec![
            FieldSchema {
                name: "id".into(),
                field_type: SemanticType::Integer,
                nullable: false,
                rules: vec![],
            },
            FieldSchema {
                name: "name".into(),
                field_type: SemanticType::Text,
                nullable: true,
                rules: vec![],
            },
        ]
    }

    #[test]
    fn dialect_from_url_scheme() {
        assert_eq!(
            Dialect::from_url("postgresql://db/x"),
            Some(Dialect::Postgres)
        );
        assert_eq!(Dialect::from_url("mssql://db"), Some(Dialect::SqlServer));
        assert_eq!(Dialect::from_url("oracle://db"), None);
    }

    #[test]
    fn stage_ddl_carries_nullability() {
        let sql = Dialect::Postgres.create_stage_table_sql("stg_customers_1", &fields());
        assert!(sql.contains("\"id\" BIGINT NOT NULL"));
        assert!(sql.contains("\"name\" TEXT"));
        assert!(!sql.contains("\"name\" TEXT NOT NULL"));
    }

    #[test]
    fn insert_sql_numbers_postgres_placeholders() {
        let sql = Dialect::Postgres.insert_sql("t", &["a", "b"], 2);
        assert!(sql.ends_with("VALUES ($1, $2), ($3, $4)"));
        let sql = Dialect::Sqlite.insert_sql("t", &["a", "b"], 2);
        assert!(sql.ends_with("VALUES (?, ?), (?, ?)"));
    }

    #[test]
    fn merge_updates_non_grain_columns_only() {
        let sql = Dialect::Postgres.merge_sql("stg", "tgt", &fields(), &["id".to_string()]);
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("\"name\" = EXCLUDED.\"name\""));
        assert!(!sql.contains("\"id\" = EXCLUDED"));
    }

    #[test]
    fn merge_with_all_grain_columns_does_nothing_on_conflict() {
        let only_grain = vec![FieldSchema {
            name: "id".into(),
            field_type: SemanticType::Integer,
            nullable: false,
            rules: vec![],
        }];
        let sql = Dialect::Sqlite.merge_sql("stg", "tgt", &only_grain, &["id".to_string()]);
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn sqlserver_merge_is_a_merge_statement() {
        let sql = Dialect::SqlServer.merge_sql("stg", "tgt", &fields(), &["id".to_string()]);
        assert!(sql.starts_with("MERGE INTO [tgt] AS t USING [stg] AS s ON t.[id] = s.[id]"));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT"));
    }

    #[test]
    fn grain_duplicate_probe_limits_to_one_row() {
        let grain = vec!["id".to_string()];
        assert!(Dialect::Postgres
            .grain_duplicate_sql("stg", &grain)
            .ends_with("LIMIT 1"));
        assert!(Dialect::SqlServer
            .grain_duplicate_sql("stg", &grain)
            .starts_with("SELECT TOP 1"));
    }

    #[test]
    fn heal_sql_compares_concatenated_grain_keys() {
        let grain = vec!["id".to_string(), "code".to_string()];
        let sql = Dialect::MySql.dlq_heal_sql("tgt", &grain);
        assert!(sql.contains("CONCAT(CAST(t.`id` AS CHAR), '|', CAST(t.`code` AS CHAR))"));
    }

    #[test]
    fn bigquery_ids_come_from_the_allocator() {
        assert!(Dialect::BigQuery.allocator_sql().is_some());
        assert!(Dialect::Postgres.allocator_sql().is_none());
    }
}
