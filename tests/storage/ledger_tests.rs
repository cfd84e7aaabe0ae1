//! IdempotencyLedger interface tests.

use chrono::{Duration, Utc};
use uuid::Uuid;

use conveyor::ledger::{IdempotencyLedger, IdempotencyRecord, Outcome};
use conveyor::storage::StorageError;

pub async fn test_unknown_message_not_processed<S: IdempotencyLedger>(store: &S) {
    let processed = store
        .has_processed(Uuid::new_v4())
        .await
        .expect("has_processed should succeed");
    assert!(!processed);
}

pub async fn test_record_then_has_processed<S: IdempotencyLedger>(store: &S) {
    let message_id = Uuid::new_v4();
    store
        .record_processed(IdempotencyRecord::new(message_id, Outcome::Applied))
        .await
        .expect("record should succeed");

    assert!(store.has_processed(message_id).await.unwrap());
}

pub async fn test_duplicate_record_rejected<S: IdempotencyLedger>(store: &S) {
    let message_id = Uuid::new_v4();
    store
        .record_processed(IdempotencyRecord::new(message_id, Outcome::Applied))
        .await
        .unwrap();

    let result = store
        .record_processed(IdempotencyRecord::new(message_id, Outcome::Rejected))
        .await;
    assert!(
        matches!(result, Err(StorageError::DuplicateRecord { message_id: id }) if id == message_id),
        "second record should be a duplicate, got {:?}",
        result
    );

    let record = store.get(message_id).await.unwrap().unwrap();
    assert_eq!(record.outcome, Outcome::Applied, "first record must win");
}

pub async fn test_get_preserves_record<S: IdempotencyLedger>(store: &S) {
    let record = IdempotencyRecord::new(Uuid::new_v4(), Outcome::Rejected);
    store.record_processed(record.clone()).await.unwrap();

    let loaded = store
        .get(record.message_id)
        .await
        .unwrap()
        .expect("record should exist");
    assert_eq!(loaded.message_id, record.message_id);
    assert_eq!(loaded.outcome, Outcome::Rejected);
    let drift = (loaded.processed_at - record.processed_at).num_milliseconds().abs();
    assert!(drift < 1, "processed_at should round-trip, drift {}ms", drift);

    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

pub async fn test_prune_removes_only_old_records<S: IdempotencyLedger>(store: &S) {
    let old = IdempotencyRecord {
        message_id: Uuid::new_v4(),
        processed_at: Utc::now() - Duration::days(30),
        outcome: Outcome::Applied,
    };
    let fresh = IdempotencyRecord::new(Uuid::new_v4(), Outcome::Applied);
    store.record_processed(old.clone()).await.unwrap();
    store.record_processed(fresh.clone()).await.unwrap();

    let removed = store
        .prune_before(Utc::now() - Duration::days(7))
        .await
        .expect("prune should succeed");

    assert!(removed >= 1);
    assert!(!store.has_processed(old.message_id).await.unwrap());
    assert!(store.has_processed(fresh.message_id).await.unwrap());
}

#[macro_export]
macro_rules! run_ledger_tests {
    ($store:expr) => {
        use $crate::storage::ledger_tests::*;

        test_unknown_message_not_processed($store).await;
        println!("  test_unknown_message_not_processed: PASSED");

        test_record_then_has_processed($store).await;
        println!("  test_record_then_has_processed: PASSED");

        test_duplicate_record_rejected($store).await;
        println!("  test_duplicate_record_rejected: PASSED");

        test_get_preserves_record($store).await;
        println!("  test_get_preserves_record: PASSED");

        test_prune_removes_only_old_records($store).await;
        println!("  test_prune_removes_only_old_records: PASSED");
    };
}
