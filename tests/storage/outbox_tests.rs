//! OutboxStore interface tests.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use conveyor::outbox::OutboxStatus;
use conveyor::storage::Store;

use super::unit_of_work_tests::{make_aggregate, make_entry, make_unit};

pub async fn test_pending_in_commit_order<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_order");
    let first = make_entry(&aggregate, "First");
    let second = make_entry(&aggregate, "Second");
    let third = make_entry(&aggregate, "Third");
    let expected = vec![first.message_id, second.message_id, third.message_id];

    store
        .stage(make_unit(&aggregate, None, json!({}), vec![first, second]))
        .await
        .unwrap();
    store
        .stage(make_unit(&aggregate, Some(1), json!({}), vec![third]))
        .await
        .unwrap();

    let pending: Vec<Uuid> = store
        .pending(10_000)
        .await
        .expect("pending should succeed")
        .into_iter()
        .filter(|e| e.aggregate == aggregate)
        .map(|e| e.message_id)
        .collect();
    assert_eq!(pending, expected);
}

pub async fn test_pending_respects_limit<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_limit");
    let entries = (0..3).map(|_| make_entry(&aggregate, "Tick")).collect();
    store
        .stage(make_unit(&aggregate, None, json!({}), entries))
        .await
        .unwrap();

    assert_eq!(store.pending(2).await.unwrap().len(), 2);
}

pub async fn test_mark_dispatched<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_dispatched");
    let entry = make_entry(&aggregate, "Shipped");
    let entry_id = entry.entry_id;
    store
        .stage(make_unit(&aggregate, None, json!({}), vec![entry]))
        .await
        .unwrap();

    store
        .mark_dispatched(entry_id, Utc::now())
        .await
        .expect("mark should succeed");

    let stored = store.get_entry(entry_id).await.unwrap().expect("entry should exist");
    assert_eq!(stored.status, OutboxStatus::Dispatched);
    assert!(stored.dispatched_at.is_some());
    assert!(store
        .pending(10_000)
        .await
        .unwrap()
        .iter()
        .all(|e| e.entry_id != entry_id));
}

pub async fn test_record_failure_keeps_pending<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_failure");
    let entry = make_entry(&aggregate, "Shipped");
    let entry_id = entry.entry_id;
    store
        .stage(make_unit(&aggregate, None, json!({}), vec![entry]))
        .await
        .unwrap();

    store.record_failure(entry_id, "exchange missing", false).await.unwrap();
    store.record_failure(entry_id, "exchange still missing", false).await.unwrap();

    let stored = store.get_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("exchange still missing"));
}

pub async fn test_record_failure_gives_up<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_give_up");
    let entry = make_entry(&aggregate, "Shipped");
    let entry_id = entry.entry_id;
    store
        .stage(make_unit(&aggregate, None, json!({}), vec![entry]))
        .await
        .unwrap();

    store.record_failure(entry_id, "rejected", true).await.unwrap();

    let stored = store.get_entry(entry_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.attempts, 1);

    // Terminal entries are no longer touched.
    store.mark_dispatched(entry_id, Utc::now()).await.unwrap();
    assert_eq!(
        store.get_entry(entry_id).await.unwrap().unwrap().status,
        OutboxStatus::Failed
    );
}

pub async fn test_failed_aggregates<S: Store>(store: &S) {
    let parked = make_aggregate("test_parked");
    let healthy = make_aggregate("test_healthy");
    let first = make_entry(&parked, "Shipped");
    let second = make_entry(&parked, "Delivered");
    let failed_id = first.entry_id;
    store
        .stage(make_unit(&parked, None, json!({}), vec![first, second]))
        .await
        .unwrap();
    store
        .stage(make_unit(&healthy, None, json!({}), vec![make_entry(&healthy, "Shipped")]))
        .await
        .unwrap();

    store.record_failure(failed_id, "rejected", true).await.unwrap();
    store.record_failure(failed_id, "rejected", true).await.unwrap();

    let failed = store.failed_aggregates().await.unwrap();
    assert_eq!(failed.iter().filter(|a| **a == parked).count(), 1);
    assert!(!failed.contains(&healthy));
}

pub async fn test_entry_round_trip<S: Store>(store: &S) {
    let aggregate = make_aggregate("test_round_trip");
    let entry = make_entry(&aggregate, "Shipped");
    store
        .stage(make_unit(&aggregate, None, json!({}), vec![entry.clone()]))
        .await
        .unwrap();

    let stored = store.get_entry(entry.entry_id).await.unwrap().unwrap();
    assert_eq!(stored.aggregate, entry.aggregate);
    assert_eq!(stored.routing_key, entry.routing_key);
    assert_eq!(stored.message_id, entry.message_id);
    assert_eq!(stored.message_type, entry.message_type);
    assert_eq!(stored.payload, entry.payload);
    assert!(stored.last_error.is_none());
    assert!(store.get_entry(Uuid::new_v4()).await.unwrap().is_none());
}

#[macro_export]
macro_rules! run_outbox_tests {
    ($store:expr) => {
        use $crate::storage::outbox_tests::*;

        test_pending_in_commit_order($store).await;
        println!("  test_pending_in_commit_order: PASSED");

        test_pending_respects_limit($store).await;
        println!("  test_pending_respects_limit: PASSED");

        test_mark_dispatched($store).await;
        println!("  test_mark_dispatched: PASSED");

        test_record_failure_keeps_pending($store).await;
        println!("  test_record_failure_keeps_pending: PASSED");

        test_record_failure_gives_up($store).await;
        println!("  test_record_failure_gives_up: PASSED");

        test_failed_aggregates($store).await;
        println!("  test_failed_aggregates: PASSED");

        test_entry_round_trip($store).await;
        println!("  test_entry_round_trip: PASSED");
    };
}
