//! SQLite adapter integration tests: control tables, load lifecycle,
//! staging, auditing queries, and the publish transaction.

use fileflow_db::{DbAdapter, DlqRow, SqliteAdapter};
use fileflow_protocol::{FieldSchema, FieldValue, LoadCounts, LoadErrorKind, LoadState, SemanticType};

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

fn grain() -> Vec<String> {
    vec!["id".into()]
}

fn row(id: i64, name: Option<&str>) -> Vec<FieldValue> {
    vec![
        FieldValue::Integer(id),
        name.map(|n| FieldValue::Text(n.into()))
            .unwrap_or(FieldValue::Null),
    ]
}

// A shared temp file, not `:memory:`: every pooled connection must see
// the same database.
async fn adapter() -> (SqliteAdapter, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("loader.db").display());
    let adapter = SqliteAdapter::connect(&url, 2).await.unwrap();
    adapter.ensure_control_tables().await.unwrap();
    (adapter, dir)
}

#[tokio::test]
async fn load_log_lifecycle_and_dedup() {
    let (adapter, _dir) = adapter().await;

    let first = adapter.begin_load("customers", "c.csv").await.unwrap();
    adapter.set_content_hash(first, "abc123").await.unwrap();
    adapter
        .finish_load(
            first,
            LoadState::Succeeded,
            LoadCounts {
                rows_read: 5,
                rows_valid: 5,
                rows_invalid: 0,
                rows_published: 5,
            },
            None,
            None,
        )
        .await
        .unwrap();

    let second = adapter.begin_load("customers", "c.csv").await.unwrap();
    assert!(second > first, "ids are monotone");
    adapter.set_content_hash(second, "abc123").await.unwrap();

    let duplicate = adapter
        .find_duplicate(second, "c.csv", "abc123")
        .await
        .unwrap();
    assert_eq!(duplicate, Some(first));

    // A different hash is not a duplicate.
    assert!(adapter
        .find_duplicate(second, "c.csv", "other")
        .await
        .unwrap()
        .is_none());

    adapter
        .finish_load(
            second,
            LoadState::Failed,
            LoadCounts::default(),
            Some(LoadErrorKind::DuplicateFile),
            Some("duplicate of 1"),
        )
        .await
        .unwrap();
    let log = adapter.fetch_load(second).await.unwrap();
    assert_eq!(log.state, LoadState::Failed);
    assert_eq!(log.error_kind.as_deref(), Some("duplicate_file"));
}

#[tokio::test]
async fn stage_insert_and_scalar_queries() {
    let (adapter, _dir) = adapter().await;
    let id = adapter.begin_load("customers", "c.csv").await.unwrap();
    let stage = format!("stg_customers_{}", id);

    adapter
        .create_stage_table(&stage, &fields(), &grain())
        .await
        .unwrap();
    let inserted = adapter
        .bulk_insert(
            &stage,
            &fields(),
            &[row(1, Some("ada")), row(2, None), row(2, Some("bob"))],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 3);

    let count = adapter
        .execute_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", stage))
        .await
        .unwrap();
    assert_eq!(count, Some(3.0));

    // id=2 is duplicated.
    let duplicate = adapter
        .first_duplicate_grain(&stage, &grain())
        .await
        .unwrap();
    assert_eq!(duplicate.as_deref(), Some("2"));

    adapter.drop_stage_table(&stage).await.unwrap();
    assert!(adapter
        .execute_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", stage))
        .await
        .is_err());
}

#[tokio::test]
async fn publish_merges_by_grain_and_heals_dlq() {
    let (adapter, _dir) = adapter().await;
    adapter
        .create_target_table("dim_customers", &fields(), &grain())
        .await
        .unwrap();

    // A previous load left id=2 in the DLQ.
    let prior = adapter.begin_load("customers", "old.csv").await.unwrap();
    adapter
        .insert_dlq_rows(&[DlqRow {
            file_load_id: prior,
            source_name: "customers".into(),
            source_row_number: 3,
            grain_key: Some("2".into()),
            failed_fields: vec!["name".into()],
            reasons: vec!["name must not be blank".into()],
            original_row_json: "{\"id\":2}".into(),
            created_at: chrono::Utc::now(),
        }])
        .await
        .unwrap();
    assert_eq!(adapter.dlq_count("customers").await.unwrap(), 1);

    let id = adapter.begin_load("customers", "c.csv").await.unwrap();
    let stage = format!("stg_customers_{}", id);
    adapter
        .create_stage_table(&stage, &fields(), &grain())
        .await
        .unwrap();
    adapter
        .bulk_insert(&stage, &fields(), &[row(1, Some("ada")), row(2, Some("bob"))])
        .await
        .unwrap();

    let outcome = adapter
        .publish(&stage, "dim_customers", &fields(), &grain(), "customers")
        .await
        .unwrap();
    assert_eq!(outcome.rows_published, 2);
    assert_eq!(outcome.dlq_cleared, 1, "healed the re-submitted grain");
    assert_eq!(adapter.dlq_count("customers").await.unwrap(), 0);

    // Re-publishing updates in place: target still has two rows.
    adapter
        .publish(&stage, "dim_customers", &fields(), &grain(), "customers")
        .await
        .unwrap();
    let total = adapter
        .execute_scalar("SELECT COUNT(*) FROM \"dim_customers\"")
        .await
        .unwrap();
    assert_eq!(total, Some(2.0));
}

#[tokio::test]
async fn dlq_insert_is_idempotent_per_row() {
    let (adapter, _dir) = adapter().await;
    let id = adapter.begin_load("orders", "o.json").await.unwrap();
    let dlq_row = DlqRow {
        file_load_id: id,
        source_name: "orders".into(),
        source_row_number: 9,
        grain_key: Some("77".into()),
        failed_fields: vec!["order_id".into()],
        reasons: vec!["duplicate grain".into()],
        original_row_json: "{\"order_id\":77}".into(),
        created_at: chrono::Utc::now(),
    };

    adapter.insert_dlq_rows(&[dlq_row.clone()]).await.unwrap();
    // A retried flush of the same buffer must not violate the PK.
    adapter.insert_dlq_rows(&[dlq_row]).await.unwrap();
    assert_eq!(adapter.dlq_count("orders").await.unwrap(), 1);

    let sample = adapter.dlq_reason_sample(id, 50).await.unwrap();
    assert_eq!(sample, vec!["row 9: duplicate grain".to_string()]);
}
