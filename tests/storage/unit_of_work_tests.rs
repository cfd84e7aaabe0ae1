//! TransactionalOutbox and AggregateStore interface tests.
//!
//! A unit of work commits its ledger record, aggregate mutation and outbox
//! entries together or not at all.

use serde_json::json;
use uuid::Uuid;

use conveyor::envelope::Envelope;
use conveyor::ledger::{IdempotencyRecord, Outcome};
use conveyor::outbox::{OutboxEntry, OutboxStatus, UnitOfWork};
use conveyor::storage::{AggregateMutation, AggregateRef, StorageError, Store};

pub fn make_aggregate(kind: &str) -> AggregateRef {
    AggregateRef::new(kind, Uuid::new_v4().to_string())
}

pub fn make_entry(aggregate: &AggregateRef, message_type: &str) -> OutboxEntry {
    OutboxEntry::new(
        aggregate.clone(),
        format!("{}.{}", aggregate.kind, aggregate.id),
        &Envelope::new(message_type, json!({ "aggregate": aggregate.to_string() })),
    )
}

pub fn make_unit(
    aggregate: &AggregateRef,
    expected_version: Option<i64>,
    state: serde_json::Value,
    entries: Vec<OutboxEntry>,
) -> UnitOfWork {
    UnitOfWork {
        record: IdempotencyRecord::new(Uuid::new_v4(), Outcome::Applied),
        mutation: Some(AggregateMutation {
            aggregate: aggregate.clone(),
            expected_version,
            state,
        }),
        entries,
    }
}

pub async fn test_load_missing_aggregate<S: Store>(store: &S) {
    let loaded = store
        .load(&make_aggregate("test_missing"))
        .await
        .expect("load should succeed");
    assert!(loaded.is_none());
}

pub async fn test_stage_commits_everything<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_commit");
    let entries = vec![
        make_entry(&aggregate, "WidgetCreated"),
        make_entry(&aggregate, "WidgetPriced"),
    ];
    let unit = make_unit(&aggregate, None, json!({ "name": "Sprocket" }), entries);
    let message_id = unit.record.message_id;

    store.stage(unit).await.expect("stage should succeed");

    assert!(store.has_processed(message_id).await.unwrap());
    let record = store.load(&aggregate).await.unwrap().expect("aggregate should exist");
    assert_eq!(record.version, 1);
    assert_eq!(record.state, json!({ "name": "Sprocket" }));

    let staged = store.entries_for(&aggregate).await.unwrap();
    assert_eq!(staged.len(), 2);
    assert_eq!(staged[0].message_type, "WidgetCreated");
    assert_eq!(staged[1].message_type, "WidgetPriced");
    assert!(staged[0].sequence < staged[1].sequence);
    assert!(staged.iter().all(|e| e.status == OutboxStatus::Pending && e.attempts == 0));
}

pub async fn test_stage_advances_version<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_version");
    store
        .stage(make_unit(&aggregate, None, json!({ "n": 1 }), vec![]))
        .await
        .unwrap();
    store
        .stage(make_unit(&aggregate, Some(1), json!({ "n": 2 }), vec![]))
        .await
        .unwrap();

    let record = store.load(&aggregate).await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.state, json!({ "n": 2 }));
}

pub async fn test_duplicate_message_writes_nothing<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_duplicate");
    let first = make_unit(&aggregate, None, json!({ "n": 1 }), vec![make_entry(&aggregate, "A")]);
    let message_id = first.record.message_id;
    store.stage(first).await.unwrap();

    let mut second = make_unit(&aggregate, Some(1), json!({ "n": 2 }), vec![make_entry(&aggregate, "B")]);
    second.record.message_id = message_id;
    let result = store.stage(second).await;

    assert!(
        matches!(result, Err(StorageError::DuplicateRecord { .. })),
        "got {:?}",
        result
    );
    let record = store.load(&aggregate).await.unwrap().unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(store.entries_for(&aggregate).await.unwrap().len(), 1);
}

pub async fn test_version_conflict_writes_nothing<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_conflict");
    store
        .stage(make_unit(&aggregate, None, json!({ "n": 1 }), vec![]))
        .await
        .unwrap();

    let stale = make_unit(&aggregate, None, json!({ "n": 99 }), vec![make_entry(&aggregate, "A")]);
    let stale_id = stale.record.message_id;
    let result = store.stage(stale).await;
    assert!(
        matches!(result, Err(StorageError::VersionConflict { .. })),
        "create over existing should conflict, got {:?}",
        result
    );

    let behind = make_unit(&aggregate, Some(7), json!({ "n": 99 }), vec![]);
    let result = store.stage(behind).await;
    assert!(
        matches!(result, Err(StorageError::VersionConflict { expected: Some(7), .. })),
        "wrong version should conflict, got {:?}",
        result
    );

    assert!(!store.has_processed(stale_id).await.unwrap(), "ledger must roll back");
    assert!(store.entries_for(&aggregate).await.unwrap().is_empty(), "outbox must roll back");
    assert_eq!(store.load(&aggregate).await.unwrap().unwrap().state, json!({ "n": 1 }));
}

pub async fn test_retry_after_rollback_commits<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_retry_after_rollback");
    store
        .stage(make_unit(&aggregate, None, json!({ "n": 1 }), vec![]))
        .await
        .unwrap();

    let mut unit = make_unit(&aggregate, Some(5), json!({ "n": 2 }), vec![make_entry(&aggregate, "B")]);
    let message_id = unit.record.message_id;
    let entries = unit.entries.clone();
    assert!(store.stage(unit).await.is_err());

    unit = make_unit(&aggregate, Some(1), json!({ "n": 2 }), entries);
    unit.record = IdempotencyRecord::new(message_id, Outcome::Applied);
    store
        .stage(unit)
        .await
        .expect("same message should commit once the conflict is resolved");

    assert!(store.has_processed(message_id).await.unwrap());
    let record = store.load(&aggregate).await.unwrap().unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(store.entries_for(&aggregate).await.unwrap().len(), 1);
}

pub async fn test_stage_without_mutation<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_no_mutation");
    let unit = UnitOfWork {
        record: IdempotencyRecord::new(Uuid::new_v4(), Outcome::Applied),
        mutation: None,
        entries: vec![make_entry(&aggregate, "Noticed")],
    };
    let message_id = unit.record.message_id;

    store.stage(unit).await.unwrap();

    assert!(store.has_processed(message_id).await.unwrap());
    assert!(store.load(&aggregate).await.unwrap().is_none());
    assert_eq!(store.entries_for(&aggregate).await.unwrap().len(), 1);
}

#[macro_export]
macro_rules! run_unit_of_work_tests {
    ($store:expr) => {
        use $crate::storage::unit_of_work_tests::*;

        test_load_missing_aggregate($store).await;
        println!("  test_load_missing_aggregate: PASSED");

        test_stage_commits_everything($store).await;
        println!("  test_stage_commits_everything: PASSED");

        test_stage_advances_version($store).await;
        println!("  test_stage_advances_version: PASSED");

        test_duplicate_message_writes_nothing($store).await;
        println!("  test_duplicate_message_writes_nothing: PASSED");

        test_version_conflict_writes_nothing($store).await;
        println!("  test_version_conflict_writes_nothing: PASSED");

        test_retry_after_rollback_commits($store).await;
        println!("  test_retry_after_rollback_commits: PASSED");

        test_stage_without_mutation($store).await;
        println!("  test_stage_without_mutation: PASSED");
    };
}
