//! End-to-end scenarios for the staged sync workflow.

use catsync_core::{
    field_map, BatchStatus, ChangeStatus, ConflictResolution, CoreError, FieldValue, Priority,
    Severity, StagingStore,
};
use catsync_engine::{
    ApprovalPolicy, EventKind, SchedulerConfig, StageRequest, SyncError, AUTO_REVIEWER,
};
use catsync_testkit::prelude::*;
use std::time::Duration;

fn is_conflict(err: &SyncError) -> bool {
    matches!(err, SyncError::Core(CoreError::Conflict { .. }))
}

#[tokio::test]
async fn price_change_applies_and_records_snapshot() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);

    let change_id = harness.stage_and_approve(mug, price(12.0));
    let batches = harness.sync_all().await;

    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.stats.succeeded, 1);

    let entity = harness.entity(mug);
    assert_eq!(entity.version, 4);
    assert_eq!(entity.last_sync_version, 4);
    assert!(!entity.sync_locked);
    assert_eq!(entity.fields["price"], FieldValue::Float(12.0));

    let versions = harness.store.versions_for_batch(batch.id);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].change_id, change_id);
    assert_eq!(versions[0].snapshot.version, 3);
    assert_eq!(versions[0].snapshot.fields["price"], FieldValue::Float(10.0));

    let change = harness.engine.change(change_id).unwrap();
    assert_eq!(change.status, ChangeStatus::Applied);
    assert_eq!(change.batch_id, Some(batch.id));
    assert_eq!(change.reviewed_by.as_deref(), Some(REVIEWER));
}

#[tokio::test]
async fn producer_edit_during_remote_call_is_not_overwritten() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness.stage_and_approve(mug, price(12.0));
    harness.remote.set_latency(Duration::from_millis(200));

    harness.engine.start_batch().unwrap();
    let edit = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.edit_locally(mug, "title", "Producer edit".into())
    };
    let (batches, edited) = tokio::join!(harness.engine.run_until_idle(), edit);
    assert_eq!(edited.version, SEED_VERSION + 1);

    let batch = &batches[0];
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.stats.succeeded, 0);
    assert_eq!(batch.stats.failed, 1);

    let entity = harness.entity(mug);
    assert_eq!(entity.version, SEED_VERSION + 1);
    assert_eq!(entity.fields["title"], FieldValue::from("Producer edit"));
    assert_eq!(entity.fields["price"], FieldValue::Float(10.0));
    assert!(!entity.sync_locked);
    assert!(harness.store.versions_for_batch(batch.id).is_empty());

    let change = harness.engine.change(change_id).unwrap();
    assert_eq!(change.status, ChangeStatus::Failed);
    let error = change.error.unwrap();
    assert!(error.contains("moved from version 3 to 4 during the remote call"), "{error}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_running_batch_keeps_applied_items() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(6, 1.0);
    let changes: Vec<_> = ids
        .iter()
        .map(|id| harness.stage_and_approve(*id, price(2.0)))
        .collect();
    harness.remote.set_latency(Duration::from_millis(100));
    let mut receiver = harness.engine.subscribe();

    harness.engine.start().unwrap();
    let batch_id = harness.engine.start_batch().unwrap()[0];
    loop {
        let event = receiver.recv().await.unwrap();
        if event.batch_id == batch_id && event.kind == EventKind::Progress {
            break;
        }
    }
    harness.engine.cancel_batch(batch_id).unwrap();
    let batch = harness.engine.wait_for_batch(batch_id).await.unwrap();
    harness.engine.shutdown().await;

    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.error.as_deref(), Some("batch cancelled"));
    assert!(batch.stats.succeeded >= 1);
    assert!(batch.stats.failed >= 1);
    assert_eq!(batch.stats.succeeded + batch.stats.failed, 6);

    let versions = harness.store.versions_for_batch(batch_id);
    assert_eq!(versions.len(), batch.stats.succeeded as usize);
    for (change_id, id) in changes.iter().zip(&ids) {
        let change = harness.engine.change(*change_id).unwrap();
        let entity = harness.entity(*id);
        assert!(!entity.sync_locked);
        match change.status {
            ChangeStatus::Applied => {
                assert_eq!(entity.version, SEED_VERSION + 1);
                assert!(versions.iter().any(|v| v.change_id == *change_id));
            }
            ChangeStatus::Failed => {
                assert_eq!(change.error.as_deref(), Some("batch cancelled"));
                assert_eq!(entity.version, SEED_VERSION);
            }
            other => panic!("change left in {other:?}"),
        }
    }
    let first = harness.engine.change(changes[0]).unwrap();
    assert_eq!(first.status, ChangeStatus::Applied);
    let last = harness.engine.change(changes[5]).unwrap();
    assert_eq!(last.status, ChangeStatus::Failed);
}

#[tokio::test]
async fn second_stage_on_locked_entity_conflicts() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);

    harness.stage(mug, price(12.0));
    let err = harness
        .engine
        .stage(StageRequest::update(mug, price(13.0)).with_priority(Priority::Critical))
        .unwrap_err();
    assert!(is_conflict(&err), "unexpected error: {err}");
    assert_eq!(harness.store.list_changes(&|_| true).len(), 1);
}

#[tokio::test]
async fn concurrent_stagers_have_one_winner() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let result = race_stage(&harness, mug, 16);
    assert_eq!((result.winners, result.losers), (1, 15));
}

#[tokio::test(start_paused = true)]
async fn throttling_mid_batch_still_completes() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(30, 10.0);
    for id in &ids {
        harness.stage_and_approve(*id, price(11.0));
    }
    harness.remote.throttle_every(7);

    let batches = harness.sync_all().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, BatchStatus::Completed);
    assert_eq!(batches[0].stats.succeeded, 30);

    let metrics = harness.engine.get_metrics();
    assert!(metrics.throttle_events > 0);
    assert_eq!(metrics.throttle_events, harness.remote.throttle_count());
    for id in ids {
        assert_eq!(harness.entity(id).fields["price"], FieldValue::Float(11.0));
    }
}

#[tokio::test(start_paused = true)]
async fn throttle_hint_pauses_the_limiter() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    harness.stage_and_approve(mug, price(11.0));
    harness
        .remote
        .throttle_next(1, Some(Duration::from_secs(2)));

    let started = tokio::time::Instant::now();
    let batches = harness.sync_all().await;
    assert_eq!(batches[0].stats.succeeded, 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(harness.engine.rate_limiter().refill_rate < 1_000.0);
}

#[tokio::test]
async fn remote_rejection_fails_one_item_of_ten() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(10, 10.0);
    let changes: Vec<_> = ids
        .iter()
        .map(|id| harness.stage_and_approve(*id, price(15.0)))
        .collect();
    harness
        .remote
        .reject_when("sku", FieldValue::from("SKU-4"), "Invalid SKU format");

    let batches = harness.sync_all().await;
    let batch = &batches[0];
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.stats.succeeded, 9);
    assert_eq!(batch.stats.failed, 1);

    let failed = harness.engine.change(changes[4]).unwrap();
    assert_eq!(failed.status, ChangeStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Invalid SKU format"));
    assert_eq!(harness.entity(ids[4]).version, SEED_VERSION);
    assert!(!harness.entity(ids[4]).sync_locked);

    for (n, change_id) in changes.iter().enumerate() {
        let status = harness.engine.change(*change_id).unwrap().status;
        let expected = if n == 4 {
            ChangeStatus::Failed
        } else {
            ChangeStatus::Applied
        };
        assert_eq!(status, expected);
    }
}

#[tokio::test]
async fn batch_size_boundary() {
    let config = fast_config().with_scheduler(SchedulerConfig::default().with_max_batch_size(5));

    let exact = TestHarness::with_config(config.clone());
    for id in exact.seed_products(5, 1.0) {
        exact.stage_and_approve(id, price(2.0));
    }
    assert_eq!(exact.engine.start_batch().unwrap().len(), 1);

    let over = TestHarness::with_config(config);
    for id in over.seed_products(6, 1.0) {
        over.stage_and_approve(id, price(2.0));
    }
    let batch_ids = over.engine.start_batch().unwrap();
    assert_eq!(batch_ids.len(), 2);
    let sizes: Vec<_> = batch_ids
        .iter()
        .map(|id| over.engine.batch(*id).unwrap().len())
        .collect();
    assert_eq!(sizes, vec![5, 1]);
}

#[tokio::test]
async fn staging_the_same_values_twice_is_a_noop() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let same = product_fields("MUG", 10.0);

    for _ in 0..2 {
        let staged = harness
            .engine
            .stage(StageRequest::update(mug, same.clone()))
            .unwrap();
        assert_eq!(staged, None);
    }
    assert!(harness.store.list_changes(&|_| true).is_empty());
    assert!(!harness.entity(mug).sync_locked);
}

#[tokio::test]
async fn internal_fields_never_stage() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let staged = harness
        .engine
        .stage(StageRequest::update(
            mug,
            field_map([("_last_import", FieldValue::from("run-7"))]),
        ))
        .unwrap();
    assert_eq!(staged, None);
}

#[tokio::test]
async fn stale_base_blocks_approval_until_resolved() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness.stage(mug, price(12.0));
    harness.edit_locally(mug, "title", FieldValue::from("Big Mug"));

    let err = harness.engine.approve(change_id, REVIEWER).unwrap_err();
    assert!(is_conflict(&err));
    let conflicts = harness.engine.conflicts_for(change_id);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].live_version, 4);
    assert!(conflicts[0].conflicting_fields.is_empty());
    assert!(harness.entity(mug).has_conflicts);

    let (conflict, rebased) = harness
        .engine
        .resolve_conflict(conflicts[0].id, ConflictResolution::KeepStaged)
        .unwrap();
    assert_eq!(conflict.resolution, Some(ConflictResolution::KeepStaged));
    assert_eq!(rebased.base_version, 4);
    assert!(!harness.entity(mug).has_conflicts);

    harness.engine.approve(change_id, REVIEWER).unwrap();
    harness.sync_all().await;

    let entity = harness.entity(mug);
    assert_eq!(entity.version, 5);
    assert_eq!(entity.fields["title"], FieldValue::from("Big Mug"));
    assert_eq!(entity.fields["price"], FieldValue::Float(12.0));
}

#[tokio::test]
async fn discarding_a_conflict_rejects_the_change() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness.stage(mug, price(12.0));
    harness.edit_locally(mug, "price", FieldValue::Float(11.0));
    let report = harness.engine.detect_conflicts();
    assert_eq!(report.conflicts.len(), 1);

    let conflict = &harness.engine.conflicts_for(change_id)[0];
    assert_eq!(conflict.conflicting_fields, vec!["price".to_string()]);
    assert_eq!(conflict.severity, Severity::High);

    let (_, change) = harness
        .engine
        .resolve_conflict(conflict.id, ConflictResolution::DiscardStaged)
        .unwrap();
    assert_eq!(change.status, ChangeStatus::Rejected);
    let entity = harness.entity(mug);
    assert!(!entity.sync_locked);
    assert!(!entity.has_conflicts);
}

#[tokio::test]
async fn detection_sweep_auto_approves_confident_changes() {
    let config = fast_config().with_approval(ApprovalPolicy::auto(90, Severity::Medium));
    let harness = TestHarness::with_config(config);
    let small = harness.seed_product("SMALL", 10.0);
    let large = harness.seed_product("LARGE", 10.0);
    let small_change = harness.stage(small, price(10.5));
    let large_change = harness.stage(large, price(40.0));

    let report = harness.engine.detect_conflicts();
    assert_eq!(report.examined, 2);
    assert_eq!(report.auto_approve, vec![small_change]);

    let approved = harness.engine.change(small_change).unwrap();
    assert_eq!(approved.status, ChangeStatus::Approved);
    assert_eq!(approved.reviewed_by.as_deref(), Some(AUTO_REVIEWER));
    assert_eq!(
        harness.engine.change(large_change).unwrap().status,
        ChangeStatus::Pending
    );
}

#[tokio::test]
async fn entity_moving_after_approval_blocks_the_change() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness.stage_and_approve(mug, price(12.0));
    harness.edit_locally(mug, "inventory", FieldValue::Int(3));

    assert!(harness.engine.start_batch().unwrap().is_empty());
    let change = harness.engine.change(change_id).unwrap();
    assert_eq!(change.status, ChangeStatus::Blocked);
    assert!(change.error.unwrap().contains("before queueing"));
    assert_eq!(harness.engine.conflicts_for(change_id).len(), 1);

    let entity = harness.entity(mug);
    assert!(!entity.sync_locked);
    assert!(!entity.has_conflicts);
    assert_eq!(harness.remote.mutation_count(), 0);
}

#[tokio::test]
async fn higher_priority_batches_run_first() {
    let harness = TestHarness::new();
    let low = harness.seed_product("LOW", 1.0);
    let critical = harness.seed_product("CRIT", 1.0);

    let low_change = harness
        .engine
        .stage(StageRequest::update(low, price(2.0)).with_priority(Priority::Low))
        .unwrap()
        .unwrap();
    let critical_change = harness
        .engine
        .stage(StageRequest::update(critical, price(2.0)).with_priority(Priority::Critical))
        .unwrap()
        .unwrap();
    harness.engine.approve(low_change, REVIEWER).unwrap();
    harness.engine.approve(critical_change, REVIEWER).unwrap();

    let batches = harness.sync_all().await;
    let order: Vec<_> = batches.iter().map(|b| b.priority).collect();
    assert_eq!(order, vec![Priority::Critical, Priority::Low]);
}

#[tokio::test]
async fn create_then_bulk_update() {
    let harness = TestHarness::new();
    let teapot = harness.seed_unsynced("TEA", 30.0);
    harness.stage_and_approve(teapot, price(29.0));
    harness.sync_all().await;

    let created = harness.entity(teapot);
    let external_id = created.external_id.clone().unwrap();
    let remote = harness.remote.record(&external_id).unwrap();
    assert_eq!(remote["price"], FieldValue::Float(29.0));
    assert_eq!(remote["sku"], FieldValue::from("TEA"));

    let change_id = harness
        .engine
        .stage(StageRequest::update(teapot, price(25.0)).via_bulk())
        .unwrap()
        .unwrap();
    harness.engine.approve(change_id, REVIEWER).unwrap();
    let batches = harness.sync_all().await;
    assert_eq!(batches[0].change_type, catsync_core::ChangeType::Bulk);
    assert_eq!(
        harness.remote.record(&external_id).unwrap()["price"],
        FieldValue::Float(25.0)
    );
}

#[tokio::test]
async fn bulk_on_unsynced_entity_is_invalid() {
    let harness = TestHarness::new();
    let teapot = harness.seed_unsynced("TEA", 30.0);
    let err = harness
        .engine
        .stage(StageRequest::update(teapot, price(1.0)).via_bulk())
        .unwrap_err();
    assert!(matches!(err, SyncError::Core(CoreError::Validation(_))));
}

#[tokio::test]
async fn delete_removes_remote_record() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness
        .engine
        .stage(StageRequest::delete(mug))
        .unwrap()
        .unwrap();
    harness.engine.approve(change_id, REVIEWER).unwrap();
    harness.sync_all().await;

    assert_eq!(harness.remote.record(&seeded_external_id("MUG")), None);
    let entity = harness.entity(mug);
    assert_eq!(entity.external_id, None);
    assert!(entity.fields.is_empty());
}

#[tokio::test]
async fn events_trace_each_batch() {
    let harness = TestHarness::new();
    let mut receiver = harness.engine.subscribe();
    for id in harness.seed_products(3, 1.0) {
        harness.stage_and_approve(id, price(2.0));
    }
    let batches = harness.sync_all().await;
    let batch_id = batches[0].id;

    let events = harness.events.events_for(batch_id);
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::OperationStart,
            EventKind::Progress,
            EventKind::Progress,
            EventKind::Progress,
            EventKind::Complete,
        ]
    );
    assert_eq!(events[1].progress_percent, 33);
    assert_eq!(events[3].progress_percent, 100);
    assert_eq!(events[4].status, BatchStatus::Completed);

    let first = receiver.recv().await.unwrap();
    assert_eq!(first.kind, EventKind::OperationStart);
    assert_eq!(first.batch_id, batch_id);
}

#[tokio::test]
async fn metrics_summarise_history() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(4, 1.0);
    for id in &ids {
        harness.stage_and_approve(*id, price(2.0));
    }
    harness
        .remote
        .reject_record(&seeded_external_id("SKU-0"), "Product is archived");
    harness.sync_all().await;

    let metrics = harness.engine.get_metrics();
    assert_eq!(metrics.batches_started, 1);
    assert_eq!(metrics.batches_completed, 1);
    assert_eq!(metrics.items_succeeded, 3);
    assert_eq!(metrics.items_failed, 1);
    assert!((metrics.success_rate - 0.75).abs() < 1e-9);
    assert_eq!(metrics.recent_batches.len(), 1);
    assert_eq!(metrics.recent_batches[0].stats.total(), 4);
    assert!(metrics.queue_depth_by_priority.values().all(|d| *d == 0));
}

#[tokio::test]
async fn queue_depth_counts_waiting_items() {
    let harness = TestHarness::new();
    for id in harness.seed_products(3, 1.0) {
        harness.stage_and_approve(id, price(2.0));
    }
    let depth = harness.engine.get_metrics().queue_depth_by_priority;
    assert_eq!(depth.get(&Priority::Normal).copied(), Some(3));

    harness.engine.start_batch().unwrap();
    let depth = harness.engine.get_metrics().queue_depth_by_priority;
    assert_eq!(depth.get(&Priority::Normal).copied(), Some(3));
}

#[tokio::test]
async fn cancelling_a_pending_batch_fails_its_items() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(2, 1.0);
    let changes: Vec<_> = ids
        .iter()
        .map(|id| harness.stage_and_approve(*id, price(2.0)))
        .collect();
    let batch_id = harness.engine.start_batch().unwrap()[0];

    let batch = harness.engine.cancel_batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.stats.failed, 2);
    for change_id in changes {
        let change = harness.engine.change(change_id).unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
    }
    for id in ids {
        assert!(!harness.entity(id).sync_locked);
    }
    assert!(harness.engine.run_until_idle().await.is_empty());
    assert_eq!(harness.remote.mutation_count(), 0);

    let err = harness.engine.cancel_batch(batch_id).unwrap_err();
    assert!(matches!(err, SyncError::Core(CoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn rejecting_releases_the_entity() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let first = harness.stage(mug, price(12.0));
    harness.engine.reject(first, REVIEWER).unwrap();

    let second = harness.stage(mug, price(13.0));
    assert_ne!(first, second);
    assert_eq!(
        harness.engine.change(first).unwrap().status,
        ChangeStatus::Rejected
    );
}

#[tokio::test]
async fn bulk_approval_reports_skips() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(3, 1.0);
    for id in &ids {
        harness.stage(*id, price(2.0));
    }
    harness.edit_locally(ids[1], "title", FieldValue::from("Renamed"));

    let report = harness.engine.bulk_approve(|_| true, REVIEWER);
    assert_eq!(report.approved.len(), 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(harness.engine.start_batch().unwrap().len(), 1);
}
