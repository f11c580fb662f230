//! End-to-end pipeline tests against the SQLite adapter: real files in
//! a temp drop directory, real staging and publish, in-memory
//! notifications.

use fileflow_db::{DbAdapter, SqliteAdapter};
use fileflow_notify::MemoryNotifier;
use fileflow_pipeline::{
    snapshot, CancellationToken, Dispatcher, PipelineContext, RetryPolicy, RunSummary,
};
use fileflow_protocol::{AppConfig, LoadErrorKind, LoadState, SourceRegistry};
use fileflow_readers::ReaderRegistry;
use fileflow_store::LocalFileStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SOURCES_TOML: &str = r#"
[[sources]]
name = "customers"
pattern = "customers*.csv"
format = "csv"
target_table = "dim_customers"
grain = ["id"]

[[sources.fields]]
name = "id"
field_type = "integer"

[[sources.fields]]
name = "name"
field_type = "text"

[[sources.fields]]
name = "age"
field_type = "integer"
nullable = true
rules = [{ rule = "min_int", value = 0 }]

[sources.notify]
recipients = ["stakeholders@example.com"]

[[sources]]
name = "orders"
pattern = "orders*.json"
format = "json"
target_table = "fact_orders"
grain = ["order_id"]
json = { record_path = "data.orders" }

[[sources.fields]]
name = "order_id"
field_type = "integer"

[[sources.fields]]
name = "amount"
field_type = "decimal"

[sources.notify]
recipients = ["stakeholders@example.com"]

[[sources]]
name = "sales"
pattern = "sales*.parquet"
format = "parquet"
target_table = "fact_sales"
grain = ["sale_id"]

[[sources.fields]]
name = "sale_id"
field_type = "integer"

[[sources.fields]]
name = "amount"
field_type = "float"

[sources.notify]
recipients = ["stakeholders@example.com"]

[[sources]]
name = "ledger"
pattern = "ledger*.csv"
format = "csv"
target_table = "fact_ledger"
grain = ["entry_id"]

[[sources.fields]]
name = "entry_id"
field_type = "integer"

[[sources.fields]]
name = "amount"
field_type = "decimal"

[[sources.audits]]
name = "positive_total"
sql = "SELECT SUM(amount) FROM {stage}"
predicate = { op = "gt", value = 0.0 }

[sources.notify]
recipients = ["stakeholders@example.com"]

[[sources]]
name = "tolerant"
pattern = "tolerant*.csv"
format = "csv"
target_table = "dim_tolerant"
grain = ["id"]
error_threshold = 5

[[sources.fields]]
name = "id"
field_type = "integer"

[[sources.fields]]
name = "age"
field_type = "integer"
nullable = true
rules = [{ rule = "min_int", value = 0 }]

[sources.notify]
recipients = ["stakeholders@example.com"]
"#;

struct Harness {
    _root: TempDir,
    drop_dir: PathBuf,
    archive_dir: PathBuf,
    duplicates_dir: PathBuf,
    quarantine_dir: PathBuf,
    adapter: Arc<SqliteAdapter>,
    notifier: Arc<MemoryNotifier>,
    registry: Arc<SourceRegistry>,
    ctx: Arc<PipelineContext>,
}

impl Harness {
    async fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let drop_dir = root.path().join("drop");
        let archive_dir = root.path().join("archive");
        let duplicates_dir = root.path().join("duplicates");
        let quarantine_dir = root.path().join("quarantine");
        for dir in [&drop_dir, &archive_dir, &duplicates_dir, &quarantine_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        let db_path = root.path().join("loader.db");

        let mut env = HashMap::new();
        env.insert("DIRECTORY_PATH", drop_dir.display().to_string());
        env.insert("ARCHIVE_PATH", archive_dir.display().to_string());
        env.insert("DUPLICATE_FILES_PATH", duplicates_dir.display().to_string());
        env.insert("QUARANTINE_PATH", quarantine_dir.display().to_string());
        env.insert("DATABASE_URL", format!("sqlite:{}", db_path.display()));
        env.insert("WORKER_COUNT", "2".to_string());
        let config = AppConfig::from_lookup(|var| env.get(var).cloned()).unwrap();

        let adapter = Arc::new(
            SqliteAdapter::connect(&config.database_url, config.worker_count as u32 + 2)
                .await
                .unwrap(),
        );
        adapter.ensure_control_tables().await.unwrap();

        let registry = Arc::new(SourceRegistry::from_toml_str(SOURCES_TOML).unwrap());
        for source in &registry.sources {
            adapter
                .create_target_table(&source.target_table, &source.fields, &source.grain)
                .await
                .unwrap();
        }

        let notifier = Arc::new(MemoryNotifier::new());
        let ctx = Arc::new(PipelineContext {
            config,
            store: Arc::new(LocalFileStore::new()),
            db: adapter.clone() as Arc<dyn DbAdapter>,
            notifier: notifier.clone() as Arc<dyn fileflow_notify::Notifier>,
            readers: Arc::new(ReaderRegistry::standard()),
            retry: RetryPolicy::new(2).with_base_delay(Duration::from_millis(1)),
            cancel: CancellationToken::new(),
        });

        Self {
            _root: root,
            drop_dir,
            archive_dir,
            duplicates_dir,
            quarantine_dir,
            adapter,
            notifier,
            registry,
            ctx,
        }
    }

    fn write(&self, name: &str, contents: &[u8]) {
        std::fs::write(self.drop_dir.join(name), contents).unwrap();
    }

    async fn run(&self) -> RunSummary {
        let jobs = snapshot(Arc::clone(&self.ctx.store), &self.drop_dir)
            .await
            .unwrap();
        Dispatcher::new(self.ctx.clone(), self.registry.clone())
            .run(jobs)
            .await
    }

    async fn count(&self, table: &str) -> f64 {
        self.adapter
            .execute_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", table))
            .await
            .unwrap()
            .unwrap_or(0.0)
    }

    async fn stage_table_count(&self) -> f64 {
        self.adapter
            .execute_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'stg_%'",
            )
            .await
            .unwrap()
            .unwrap_or(0.0)
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

fn sample_parquet(rows: &[(i64, f64)]) -> Vec<u8> {
    use arrow::array::{Float64Array, Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc as StdArc;

    let schema = Schema::new(vec![
        Field::new("sale_id", DataType::Int64, false),
        Field::new("amount", DataType::Float64, false),
    ]);
    let batch = RecordBatch::try_new(
        StdArc::new(schema),
        vec![
            StdArc::new(Int64Array::from(
                rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            )),
            StdArc::new(Float64Array::from(
                rows.iter().map(|(_, amount)| *amount).collect::<Vec<_>>(),
            )),
        ],
    )
    .unwrap();

    let mut out = Vec::new();
    let mut writer = parquet::arrow::ArrowWriter::try_new(&mut out, batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    out
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn valid_csv_publishes_and_cleans_up() {
    let h = Harness::new().await;
    h.write(
        "customers_2024.csv",
        b"id,name,age\n1,ada,30\n2,bob,41\n3,cyd,\n4,dee,22\n5,eli,9\n",
    );

    let summary = h.run().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.exit_code(), 0);

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.state, LoadState::Succeeded);
    assert_eq!(outcome.counts.rows_read, 5);
    assert_eq!(outcome.counts.rows_valid, 5);
    assert_eq!(outcome.counts.rows_invalid, 0);
    assert_eq!(outcome.counts.rows_published, 5);
    assert!(outcome.counts.is_conserved());

    assert_eq!(h.count("dim_customers").await, 5.0);
    assert_eq!(h.count("file_load_dlq").await, 0.0);
    assert_eq!(h.stage_table_count().await, 0.0);

    // Archived, deleted from drop, nothing quarantined.
    assert!(Harness::files_in(&h.drop_dir).is_empty());
    assert_eq!(
        Harness::files_in(&h.archive_dir),
        vec!["customers_2024.csv".to_string()]
    );
    assert!(Harness::files_in(&h.quarantine_dir).is_empty());

    let log = h
        .adapter
        .fetch_load(outcome.file_load_id.unwrap())
        .await
        .unwrap();
    assert_eq!(log.state, LoadState::Succeeded);
}

#[tokio::test(flavor = "multi_thread")]
async fn rule_violation_trips_zero_threshold() {
    let h = Harness::new().await;
    h.write(
        "customers_2024.csv",
        b"id,name,age\n1,ada,30\n2,bob,41\n3,cyd,-1\n4,dee,22\n5,eli,9\n",
    );

    let summary = h.run().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exit_code(), 0, "file-level failures are not process failures");

    let outcome = &summary.outcomes[0];
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, LoadErrorKind::ValidationThresholdExceeded);
    assert_eq!(outcome.counts.rows_read, 5);
    assert_eq!(outcome.counts.rows_invalid, 1);

    // Target untouched, DLQ populated, stage dropped, file quarantined.
    assert_eq!(h.count("dim_customers").await, 0.0);
    assert_eq!(h.count("file_load_dlq").await, 1.0);
    assert_eq!(h.stage_table_count().await, 0.0);
    assert_eq!(
        Harness::files_in(&h.quarantine_dir),
        vec!["customers_2024.csv".to_string()]
    );

    // Stakeholders see the failing field.
    assert_eq!(h.notifier.email_count(), 1);
    let emails = h.notifier.emails.lock().unwrap();
    assert!(emails[0].subject.contains("validation_threshold_exceeded"));
    assert!(emails[0].body.contains("age"));
    assert!(emails[0].body.contains("row 3"));
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_grain_in_json_fails_grain_validation() {
    let h = Harness::new().await;
    let orders: Vec<String> = (1..=9)
        .map(|i| {
            let order_id = if i == 4 || i == 9 { 77 } else { i };
            format!(r#"{{"order_id": {}, "amount": "10.00"}}"#, order_id)
        })
        .collect();
    let body = format!(r#"{{"data": {{"orders": [{}]}}}}"#, orders.join(","));
    h.write("orders_feb.json", body.as_bytes());

    let summary = h.run().await;
    let outcome = &summary.outcomes[0];
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, LoadErrorKind::GrainValidationError);
    assert!(failure.detail.contains("77"));

    assert_eq!(h.count("fact_orders").await, 0.0);
    assert_eq!(h.stage_table_count().await, 0.0);

    // Exactly one DLQ row: the second occurrence, row 9.
    assert_eq!(h.count("file_load_dlq").await, 1.0);
    let sample = h
        .adapter
        .dlq_reason_sample(outcome.file_load_id.unwrap(), 50)
        .await
        .unwrap();
    assert_eq!(sample.len(), 1);
    assert!(sample[0].starts_with("row 9:"));
    assert!(sample[0].contains("DuplicateGrain"));
}

#[tokio::test(flavor = "multi_thread")]
async fn gzipped_parquet_reprocessing_is_deduplicated() {
    let h = Harness::new().await;
    let parquet = sample_parquet(&[(1, 10.0), (2, 20.0)]);
    h.write("sales_q1.parquet.gz", &gzip(&parquet));

    let summary = h.run().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.count("fact_sales").await, 2.0);

    // Same bytes re-uploaded: the second run is a duplicate.
    h.write("sales_q1.parquet.gz", &gzip(&parquet));
    let summary = h.run().await;
    let outcome = &summary.outcomes[0];
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, LoadErrorKind::DuplicateFile);

    assert_eq!(h.count("fact_sales").await, 2.0);
    assert_eq!(
        Harness::files_in(&h.duplicates_dir),
        vec!["sales_q1.parquet.gz".to_string()]
    );
    assert_eq!(h.notifier.email_count(), 1);

    // Exactly one succeeded log row for the filename+hash pair.
    let succeeded = h
        .adapter
        .execute_scalar(
            "SELECT COUNT(*) FROM file_load_log WHERE state = 'succeeded' AND filename = 'sales_q1.parquet.gz'",
        )
        .await
        .unwrap();
    assert_eq!(succeeded, Some(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_audit_blocks_publish() {
    let h = Harness::new().await;
    h.write("ledger_march.csv", b"entry_id,amount\n1,0.00\n2,0.00\n");

    let summary = h.run().await;
    let outcome = &summary.outcomes[0];
    let failure = outcome.failure.as_ref().unwrap();
    assert_eq!(failure.kind, LoadErrorKind::AuditFailedError);
    assert!(failure.detail.contains("positive_total"));
    assert!(failure.detail.contains("observed 0"));

    assert_eq!(h.count("fact_ledger").await, 0.0);
    assert_eq!(h.stage_table_count().await, 0.0);
    assert_eq!(
        Harness::files_in(&h.quarantine_dir),
        vec!["ledger_march.csv".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_files_do_not_interleave() {
    let h = Harness::new().await;
    h.write("customers_a.csv", b"id,name,age\n1,ada,30\n2,bob,41\n");
    h.write(
        "sales_b.parquet",
        &sample_parquet(&[(10, 1.0), (11, 2.0), (12, 3.0)]),
    );

    let summary = h.run().await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(h.count("dim_customers").await, 2.0);
    assert_eq!(h.count("fact_sales").await, 3.0);
    assert_eq!(h.stage_table_count().await, 0.0);

    // file_load_ids are unique and both rows terminal.
    let mut ids: Vec<i64> = summary
        .outcomes
        .iter()
        .map(|o| o.file_load_id.unwrap().as_i64())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    for outcome in &summary.outcomes {
        let log = h.adapter.fetch_load(outcome.file_load_id.unwrap()).await.unwrap();
        assert!(log.state.is_terminal());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_tolerates_and_dlq_heals_on_reload() {
    let h = Harness::new().await;

    // One bad row, threshold 5: the file succeeds and the bad row lands
    // in the DLQ.
    h.write("tolerant_v1.csv", b"id,age\n1,10\n2,-3\n3,12\n");
    let summary = h.run().await;
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.state, LoadState::Succeeded);
    assert_eq!(outcome.counts.rows_valid, 2);
    assert_eq!(outcome.counts.rows_invalid, 1);
    assert_eq!(outcome.counts.rows_published, 2);
    assert_eq!(h.count("dim_tolerant").await, 2.0);
    assert_eq!(h.adapter.dlq_count("tolerant").await.unwrap(), 1);

    // The corrected resubmission publishes grain 2 and heals its DLQ row.
    h.write("tolerant_v2.csv", b"id,age\n2,3\n");
    let summary = h.run().await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.count("dim_tolerant").await, 3.0);
    assert_eq!(h.adapter.dlq_count("tolerant").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_files_move_to_duplicates_without_db_state() {
    let h = Harness::new().await;
    h.write("mystery.txt", b"who am i");

    let summary = h.run().await;
    assert_eq!(summary.unmatched, 1);
    assert_eq!(summary.outcomes.len(), 0);
    assert_eq!(
        Harness::files_in(&h.duplicates_dir),
        vec!["mystery.txt".to_string()]
    );
    assert_eq!(h.count("file_load_log").await, 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_column_quarantines_with_email() {
    let h = Harness::new().await;
    h.write("customers_bad.csv", b"id,name\n1,ada\n");

    let summary = h.run().await;
    let failure = summary.outcomes[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, LoadErrorKind::MissingColumns);
    assert!(failure.detail.contains("age"));
    assert_eq!(
        Harness::files_in(&h.quarantine_dir),
        vec!["customers_bad.csv".to_string()]
    );
    assert_eq!(h.notifier.email_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_takes_the_cleanup_path() {
    let h = Harness::new().await;
    h.write("customers_2024.csv", b"id,name,age\n1,ada,30\n");
    h.ctx.cancel.cancel();

    let summary = h.run().await;
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.exit_code(), 0);
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.state, LoadState::Cancelled);
    assert_eq!(h.stage_table_count().await, 0.0);
    assert_eq!(
        Harness::files_in(&h.quarantine_dir),
        vec!["customers_2024.csv".to_string()]
    );
    // Cancellation is not an error: no emails, no failure webhooks.
    assert_eq!(h.notifier.email_count(), 0);
}
