use serde_json::{json, Map};
use std::sync::Arc;

use super::fakes::FakeStore;
use crate::errors::AutomationError;
use crate::queue::OfflineQueue;
use crate::sync::{SyncAction, SyncOperation, SyncService};

fn service(store: Arc<FakeStore>, dir: &tempfile::TempDir) -> SyncService {
    SyncService::new(store, Arc::new(OfflineQueue::in_dir(dir.path())))
}

fn patient_op(name: &str) -> SyncOperation {
    let mut fields = Map::new();
    fields.insert("patient_name".into(), json!(name));
    SyncOperation::create_patient(fields)
}

#[test]
fn failed_submit_is_queued_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let sync = service(Arc::new(FakeStore::always_failing()), &dir);

    match sync.submit(patient_op("홍길동")).unwrap_err() {
        AutomationError::RemoteSyncFailed { action, queued, .. } => {
            assert_eq!(action, "create_patient");
            assert!(queued);
        }
        other => panic!("expected RemoteSyncFailed, got {other:?}"),
    }

    let items = sync.queue().items().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].action_type, "create_patient");
    assert_eq!(items[0].payload["fields"]["patient_name"], "홍길동");
}

#[test]
fn successful_submit_leaves_queue_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::healthy());
    let sync = service(store.clone(), &dir);

    let receipt = sync.submit(patient_op("김철수")).unwrap();
    assert_eq!(receipt.record_id.as_deref(), Some("rec1"));
    assert!(sync.queue().is_empty().unwrap());
    assert_eq!(store.calls().len(), 1);
}

#[test]
fn always_failing_item_is_dropped_after_three_replays() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::always_failing());
    let sync = service(store.clone(), &dir);
    sync.submit(patient_op("A")).unwrap_err();

    for attempt in 1..=2 {
        let summary = sync.replay_pending().unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.remaining, 1);
        assert_eq!(sync.queue().items().unwrap()[0].retry_count, attempt);
    }

    let summary = sync.replay_pending().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.remaining, 0);
    assert!(sync.queue().is_empty().unwrap());

    let errors = summary.errors();
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        AutomationError::QueueExhausted {
            action, attempts, ..
        } => {
            assert_eq!(action, "create_patient");
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected QueueExhausted, got {other:?}"),
    }
    // initial submit plus three replays
    assert_eq!(store.calls().len(), 4);
}

#[test]
fn item_succeeding_on_second_replay_is_processed() {
    let dir = tempfile::tempdir().unwrap();
    // initial submit and first replay fail
    let store = Arc::new(FakeStore::failing_first(2));
    let sync = service(store, &dir);
    sync.submit(patient_op("B")).unwrap_err();

    let first = sync.replay_pending().unwrap();
    assert_eq!((first.processed, first.failed, first.remaining), (0, 0, 1));

    let second = sync.replay_pending().unwrap();
    assert_eq!(second.processed, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(second.remaining, 0);
}

#[test]
fn replay_preserves_queue_order_and_action() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FakeStore::always_failing());
    let sync = service(store.clone(), &dir);
    sync.submit(patient_op("first")).unwrap_err();
    sync.submit(SyncOperation::update_result("rec9", Map::new()))
        .unwrap_err();

    sync.replay_pending().unwrap();
    let replayed: Vec<SyncAction> = store.calls()[2..].iter().map(|op| op.action).collect();
    assert_eq!(
        replayed,
        vec![SyncAction::CreatePatient, SyncAction::UpdateResult]
    );
    assert_eq!(store.calls()[3].payload["record_id"], "rec9");
}

#[test]
fn items_enqueued_during_replay_survive() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(OfflineQueue::in_dir(dir.path()));
    queue.enqueue("create_patient", json!({"fields": {}})).unwrap();

    let inner = queue.clone();
    let summary = queue
        .replay(|_| {
            inner.enqueue("update_result", json!({"record_id": "rec2", "fields": {}}))?;
            Ok(())
        })
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.remaining, 1);
    let left = queue.items().unwrap();
    assert_eq!(left[0].action_type, "update_result");
}
