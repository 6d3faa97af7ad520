//! Chunked bulk load tests against an in-memory DuckDB warehouse

#![cfg(feature = "duckdb-backend")]

mod common;

use common::*;
use dwh_loader::{
    BatchSchema, BulkLoadOptions, ColumnDef, ColumnType, ConflictPolicy, FailurePolicy, LoadError,
    TabularBatch, TransactionScope, Value,
};

async fn transactions_loader() -> TestLoader {
    let loader = loader();
    execute(&loader, CREATE_TRANSACTIONS).await;
    loader
}

#[tokio::test]
async fn test_one_transaction_per_chunk() {
    let loader = transactions_loader().await;
    let batch = transaction_batch(25);

    let outcome = loader
        .bulk_load(&batch, "fact_transactions", &BulkLoadOptions::default().with_chunk_size(10))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.rows_attempted, 25);
    assert_eq!(outcome.rows_inserted, 25);
    assert_eq!(outcome.chunks_committed, 3);
    assert_eq!(counters(&loader).begins.get(), 3);
    assert_eq!(counters(&loader).commits.get(), 3);
    assert_eq!(counters(&loader).sessions.get(), 1);
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 25);
}

#[tokio::test]
async fn test_exact_multiple_of_chunk_size() {
    let loader = transactions_loader().await;

    let outcome = loader
        .bulk_load(
            &transaction_batch(20),
            "fact_transactions",
            &BulkLoadOptions::default().with_chunk_size(10),
        )
        .await
        .unwrap();

    assert_eq!(outcome.chunks_committed, 2);
    assert_eq!(counters(&loader).begins.get(), 2);
}

#[tokio::test]
async fn test_failing_chunk_is_the_only_one_missing() {
    let loader = transactions_loader().await;
    // Row 15 already exists, so the second chunk hits the primary key
    execute(&loader, "INSERT INTO fact_transactions (txn_id) VALUES (15)").await;

    let outcome = loader
        .bulk_load(
            &transaction_batch(25),
            "fact_transactions",
            &BulkLoadOptions::default().with_chunk_size(10),
        )
        .await
        .unwrap();

    assert!(!outcome.is_success());
    assert!(!outcome.aborted);
    assert_eq!(outcome.chunks_committed, 2);
    assert_eq!(outcome.rows_inserted, 15);
    assert_eq!(outcome.rows_failed, 10);
    assert_eq!(outcome.chunk_failures.len(), 1);
    assert_eq!(outcome.chunk_failures[0].chunk_index, 1);
    assert_eq!(outcome.chunk_failures[0].rows, 10..20);
    assert!(outcome.error_detail.is_some());
    assert_eq!(counters(&loader).rollbacks.get(), 1);

    // Nothing of chunk 1 landed except the pre-existing row
    let result = loader
        .query(
            "SELECT COUNT(*) FROM fact_transactions WHERE txn_id BETWEEN 11 AND 20",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(result.scalar(), Some(&Value::Int(1)));
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 16);
}

#[tokio::test]
async fn test_whole_batch_uses_one_transaction() {
    let loader = transactions_loader().await;
    let options = BulkLoadOptions::default()
        .with_chunk_size(10)
        .with_transaction_scope(TransactionScope::WholeBatch);

    let outcome = loader
        .bulk_load(&transaction_batch(25), "fact_transactions", &options)
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.rows_attempted, 25);
    assert_eq!(outcome.rows_inserted, 25);
    assert_eq!(outcome.chunks_committed, 1);
    assert_eq!(counters(&loader).begins.get(), 1);
    assert_eq!(counters(&loader).commits.get(), 1);
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 25);
}

#[tokio::test]
async fn test_whole_batch_failure_leaves_nothing() {
    let loader = transactions_loader().await;
    execute(&loader, "INSERT INTO fact_transactions (txn_id) VALUES (15)").await;
    let options = BulkLoadOptions::default()
        .with_chunk_size(10)
        .with_transaction_scope(TransactionScope::WholeBatch);

    let outcome = loader
        .bulk_load(&transaction_batch(25), "fact_transactions", &options)
        .await
        .unwrap();

    assert!(!outcome.is_success());
    assert!(outcome.aborted);
    assert_eq!(outcome.rows_inserted, 0);
    assert_eq!(outcome.rows_failed, 25);
    assert_eq!(outcome.chunks_committed, 0);
    assert_eq!(outcome.chunk_failures.len(), 1);
    assert_eq!(outcome.chunk_failures[0].chunk_index, 1);
    assert_eq!(outcome.chunk_failures[0].rows, 0..25);
    assert_eq!(counters(&loader).begins.get(), 1);
    assert_eq!(counters(&loader).rollbacks.get(), 1);

    // Chunk 0 was inserted before the failure and rolled back with it
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 1);
}

#[tokio::test]
async fn test_whole_batch_empty() {
    let loader = transactions_loader().await;
    let options = BulkLoadOptions::default().with_transaction_scope(TransactionScope::WholeBatch);

    let outcome = loader
        .bulk_load(&transaction_batch(0), "fact_transactions", &options)
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(counters(&loader).begins.get(), 0);
}

#[tokio::test]
async fn test_refused_begin_keeps_committed_chunks_in_outcome() {
    let loader = transactions_loader().await;
    counters(&loader).refuse_begin_from.set(Some(2));

    let outcome = loader
        .bulk_load(
            &transaction_batch(25),
            "fact_transactions",
            &BulkLoadOptions::default().with_chunk_size(10),
        )
        .await
        .unwrap();

    assert!(outcome.aborted);
    assert_eq!(outcome.chunks_committed, 1);
    assert_eq!(outcome.rows_inserted, 10);
    assert_eq!(outcome.rows_attempted, 20);
    assert_eq!(outcome.chunk_failures.len(), 1);
    assert_eq!(outcome.chunk_failures[0].chunk_index, 1);
    assert!(outcome.chunk_failures[0].error.contains("BEGIN refused"));
    assert_eq!(counters(&loader).rollbacks.get(), 0);

    counters(&loader).refuse_begin_from.set(None);
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 10);
}

#[tokio::test]
async fn test_abort_on_first_failure() {
    let loader = transactions_loader().await;
    execute(&loader, "INSERT INTO fact_transactions (txn_id) VALUES (3)").await;

    let options = BulkLoadOptions::default()
        .with_chunk_size(10)
        .with_failure_policy(FailurePolicy::AbortOnFirstFailure);
    let outcome = loader
        .bulk_load(&transaction_batch(25), "fact_transactions", &options)
        .await
        .unwrap();

    assert!(outcome.aborted);
    assert_eq!(outcome.rows_attempted, 10);
    assert_eq!(outcome.chunks_committed, 0);
    assert_eq!(counters(&loader).begins.get(), 1);
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 1);
}

#[tokio::test]
async fn test_skip_conflicts() {
    let loader = transactions_loader().await;
    execute(&loader, "INSERT INTO fact_transactions (txn_id) VALUES (15)").await;

    let options = BulkLoadOptions::default()
        .with_chunk_size(10)
        .with_conflict_policy(ConflictPolicy::Skip);
    let outcome = loader
        .bulk_load(&transaction_batch(25), "fact_transactions", &options)
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.rows_inserted, 24);
    assert_eq!(loader.row_count("fact_transactions").await.unwrap(), 25);
}

#[tokio::test]
async fn test_row_order_and_values_preserved() {
    let loader = transactions_loader().await;
    let batch = transaction_batch(5);

    loader
        .bulk_load(&batch, "fact_transactions", &BulkLoadOptions::default().with_chunk_size(2))
        .await
        .unwrap();

    let result = loader
        .query(
            "SELECT txn_id, client_id, amount, created_at, channel FROM fact_transactions ORDER BY txn_id",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(result.row_count(), 5);
    for (stored, original) in result.rows.iter().zip(batch.rows()) {
        assert_eq!(&stored[..4], original.as_slice());
        // Columns missing from the batch take their defaults
        assert_eq!(stored[4], Value::from("api"));
    }
}

#[tokio::test]
async fn test_zero_chunk_size_is_rejected() {
    let loader = transactions_loader().await;

    let err = loader
        .bulk_load(
            &transaction_batch(3),
            "fact_transactions",
            &BulkLoadOptions::default().with_chunk_size(0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::InvalidInput(_)));
    // Only the fixture session was opened
    assert_eq!(counters(&loader).sessions.get(), 1);
}

#[tokio::test]
async fn test_unknown_column_is_a_schema_mismatch() {
    let loader = transactions_loader().await;
    let schema = BatchSchema::new(vec![
        ColumnDef::new("txn_id", ColumnType::Integer),
        ColumnDef::new("merchant", ColumnType::Text),
    ]);
    let batch = TabularBatch::new(schema, vec![vec![Value::Int(1), Value::from("shop")]]).unwrap();

    let err = loader
        .bulk_load(&batch, "fact_transactions", &BulkLoadOptions::default())
        .await
        .unwrap_err();

    match err {
        LoadError::SchemaMismatch(message) => assert!(message.contains("merchant")),
        other => panic!("expected SchemaMismatch, got {:?}", other),
    }
    assert_eq!(counters(&loader).begins.get(), 0);
}

#[tokio::test]
async fn test_missing_table_is_a_schema_mismatch() {
    let loader = loader();
    let err = loader
        .bulk_load(&transaction_batch(1), "fact_missing", &BulkLoadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::SchemaMismatch(_)));
}

#[tokio::test]
async fn test_empty_batch() {
    let loader = transactions_loader().await;
    let outcome = loader
        .bulk_load(&transaction_batch(0), "fact_transactions", &BulkLoadOptions::default())
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.chunks_committed, 0);
    assert_eq!(counters(&loader).begins.get(), 0);
}

#[tokio::test]
async fn test_default_schema_applies_to_unqualified_names() {
    let loader = loader().with_default_schema("dwh");
    execute(&loader, "CREATE SCHEMA dwh").await;
    execute(&loader, &CREATE_TRANSACTIONS.replace("fact_transactions", "dwh.fact_transactions")).await;

    let outcome = loader
        .bulk_load(&transaction_batch(4), "fact_transactions", &BulkLoadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.table, "dwh.fact_transactions");
    assert_eq!(loader.row_count("dwh.fact_transactions").await.unwrap(), 4);
}
