//! Tests for bulk loading through the repository

use std::sync::Arc;

use dynrepo::bulk::{BulkOptions, BulkPayload};
use dynrepo::command::CommandOptions;
use dynrepo::connection::{Connection, DatabaseType, Transaction};
use dynrepo::error::{Error, ErrorCategory};
use dynrepo::testing::MockDatabase;
use dynrepo::types::Value;

fn payload(rows: i32) -> BulkPayload {
    let mut payload = BulkPayload::new(["Id", "Label"]);
    for id in 0..rows {
        payload
            .push_row(vec![Value::Int32(id), Value::String(format!("row-{}", id))])
            .unwrap();
    }
    payload
}

#[tokio::test]
async fn test_empty_payload_touches_nothing() {
    let db = MockDatabase::new();
    let written = db
        .repository()
        .bulk_insert(&payload(0), &BulkOptions::new("staging.items"), &CommandOptions::new())
        .await
        .unwrap();

    assert_eq!(written, 0);
    assert_eq!(db.connections_opened(), 0);
}

#[tokio::test]
async fn test_batches_commit_together() {
    let db = MockDatabase::new();
    let options = BulkOptions::new("staging.items")
        .map_column("Id", "item_id")
        .map_column("Label", "label")
        .with_batch_size(4);

    let written = db
        .repository()
        .bulk_insert(&payload(10), &options, &CommandOptions::new())
        .await
        .unwrap();

    assert_eq!(written, 10);
    assert_eq!(db.copy_batches(), 3);
    assert_eq!(db.copied_rows().len(), 10);
    assert_eq!(db.transactions_begun(), 1);
    assert_eq!(db.commits(), 1);
    assert_eq!(db.connections_closed(), 1);

    let statements = db.statements();
    assert!(statements.iter().all(|s| s.in_transaction));
    assert_eq!(
        statements[0].sql,
        "COPY staging.items (item_id, label) FROM STDIN WITH (FORMAT text)"
    );
}

#[tokio::test]
async fn test_failed_batch_rolls_back_everything() {
    let db = MockDatabase::new();
    let repo = db.repository();

    db.fail_next(Error::Constraint {
        constraint_name: "items_pkey".into(),
        message: "duplicate key".into(),
    });
    let err = repo
        .bulk_insert(
            &payload(10),
            &BulkOptions::new("staging.items").with_batch_size(5),
            &CommandOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.commits(), 0);
    assert!(db.copied_rows().is_empty());
}

#[tokio::test]
async fn test_transient_failure_retries_whole_load() {
    let db = MockDatabase::new();
    db.fail_next(Error::deadlock("deadlock detected"));
    let repo = db.repository();

    let written = repo
        .bulk_insert(
            &payload(6),
            &BulkOptions::new("staging.items").with_batch_size(3),
            &CommandOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(written, 6);
    assert_eq!(db.rollbacks(), 1);
    assert_eq!(db.commits(), 1);
    // rolled-back rows never become visible
    assert_eq!(db.copied_rows().len(), 6);
}

#[tokio::test]
async fn test_load_joins_ambient_transaction() {
    let db = MockDatabase::new();
    let connection: Arc<dyn Connection> = Arc::new(db.connection());
    let transaction: Arc<dyn Transaction> = Arc::from(connection.begin().await.unwrap());
    let mut repo = db.repository();
    repo.set_connection(connection);
    repo.set_transaction(transaction.clone());

    repo.bulk_insert(&payload(3), &BulkOptions::new("items"), &CommandOptions::new())
        .await
        .unwrap();
    assert!(db.copied_rows().is_empty());
    assert_eq!(db.transactions_begun(), 1);

    transaction.commit().await.unwrap();
    assert_eq!(db.copied_rows().len(), 3);
}

#[tokio::test]
async fn test_invalid_target_rejected_before_connecting() {
    let db = MockDatabase::new();
    let repo = db.repository();

    let err = repo
        .bulk_insert(
            &payload(1),
            &BulkOptions::new("items; DROP TABLE users"),
            &CommandOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(db.connections_opened(), 0);
}

#[tokio::test]
async fn test_sqlserver_bulk_unsupported() {
    let db = MockDatabase::with_database_type(DatabaseType::SqlServer);
    let err = db
        .repository()
        .bulk_insert(&payload(1), &BulkOptions::new("dbo.Items"), &CommandOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Unsupported { .. }));
    assert_eq!(db.connections_opened(), 0);
}
