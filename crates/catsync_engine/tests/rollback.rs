//! Rollback of applied batches, locally and on the remote.

use catsync_core::{BatchStatus, ChangeStatus, CoreError, FieldValue, StagingStore};
use catsync_engine::{StageRequest, SyncError};
use catsync_testkit::prelude::*;

#[tokio::test]
async fn rollback_restores_snapshot_bytes_and_remote() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(3, 10.0);
    let before: Vec<_> = ids
        .iter()
        .map(|id| harness.entity(*id).snapshot().encode().unwrap())
        .collect();
    let changes: Vec<_> = ids
        .iter()
        .map(|id| harness.stage_and_approve(*id, price(99.0)))
        .collect();
    let batch = harness.sync_all().await.remove(0);
    assert_eq!(batch.status, BatchStatus::Completed);

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.batch_status, BatchStatus::RolledBack);
    assert_eq!(report.items.len(), 3);
    // Newest first.
    assert_eq!(report.items[0].change_id, changes[2]);

    for (n, id) in ids.iter().enumerate() {
        let entity = harness.entity(*id);
        assert_eq!(entity.snapshot().encode().unwrap(), before[n]);
        assert!(!entity.sync_locked);
        let remote = harness
            .remote
            .record(&seeded_external_id(&format!("SKU-{n}")))
            .unwrap();
        assert_eq!(remote["price"], FieldValue::Float(10.0));
    }
    for change_id in changes {
        assert_eq!(
            harness.engine.change(change_id).unwrap().status,
            ChangeStatus::RolledBack
        );
    }
    assert_eq!(
        harness.engine.batch(batch.id).unwrap().status,
        BatchStatus::RolledBack
    );
    assert_eq!(harness.engine.get_metrics().batches_rolled_back, 1);
}

#[tokio::test]
async fn remote_edit_makes_rollback_partial() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    harness.stage_and_approve(mug, price(12.0));
    let batch = harness.sync_all().await.remove(0);

    let external_id = seeded_external_id("MUG");
    assert!(harness
        .remote
        .edit_record(&external_id, "title", FieldValue::from("Edited elsewhere")));

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert!(!report.is_complete());
    let partial = report.partial();
    assert_eq!(partial.len(), 1);
    assert!(partial[0].reverted_locally);
    assert!(!partial[0].reverted_remotely);
    assert!(partial[0]
        .reason
        .as_deref()
        .unwrap()
        .contains("modified since the batch"));

    // The remote keeps the foreign edit and the applied price.
    let remote = harness.remote.record(&external_id).unwrap();
    assert_eq!(remote["price"], FieldValue::Float(12.0));
    assert_eq!(harness.entity(mug).fields["price"], FieldValue::Float(10.0));
}

#[tokio::test]
async fn local_edit_after_apply_blocks_local_revert() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness.stage_and_approve(mug, price(12.0));
    let batch = harness.sync_all().await.remove(0);
    harness.edit_locally(mug, "title", FieldValue::from("Renamed"));

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert_eq!(report.batch_status, BatchStatus::Completed);
    assert!(!report.items[0].reverted_locally);
    assert!(!report.items[0].reverted_remotely);

    let entity = harness.entity(mug);
    assert_eq!(entity.version, 5);
    assert_eq!(entity.fields["price"], FieldValue::Float(12.0));
    assert_eq!(
        harness.engine.change(change_id).unwrap().status,
        ChangeStatus::Applied
    );
    assert_eq!(harness.engine.get_metrics().batches_rolled_back, 0);
}

#[tokio::test]
async fn rolling_back_a_create_deletes_the_record() {
    let harness = TestHarness::new();
    let teapot = harness.seed_unsynced("TEA", 30.0);
    harness.stage_and_approve(teapot, price(28.0));
    let batch = harness.sync_all().await.remove(0);
    assert_eq!(harness.remote.record_count(), 1);

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(harness.remote.record_count(), 0);

    let entity = harness.entity(teapot);
    assert_eq!(entity.external_id, None);
    assert_eq!(entity.fields["price"], FieldValue::Float(30.0));
}

#[tokio::test]
async fn rolling_back_a_delete_recreates_the_record() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    let change_id = harness
        .engine
        .stage(StageRequest::delete(mug))
        .unwrap()
        .unwrap();
    harness.engine.approve(change_id, REVIEWER).unwrap();
    let batch = harness.sync_all().await.remove(0);
    assert_eq!(harness.remote.record_count(), 0);

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert!(report.is_complete());

    let entity = harness.entity(mug);
    let external_id = entity.external_id.clone().unwrap();
    assert_ne!(external_id, seeded_external_id("MUG"));
    assert_eq!(entity.version, SEED_VERSION);
    assert_eq!(
        harness.remote.record(&external_id).unwrap(),
        product_fields("MUG", 10.0)
    );
}

#[tokio::test]
async fn only_applied_items_roll_back() {
    let harness = TestHarness::new();
    let ids = harness.seed_products(2, 10.0);
    for id in &ids {
        harness.stage_and_approve(*id, price(20.0));
    }
    harness
        .remote
        .reject_record(&seeded_external_id("SKU-1"), "Product is archived");
    let batch = harness.sync_all().await.remove(0);
    assert_eq!(batch.stats.failed, 1);

    let report = harness.engine.rollback(batch.id).await.unwrap();
    assert_eq!(report.items.len(), 1);
    assert_eq!(report.items[0].entity_id, ids[0]);
    assert_eq!(report.batch_status, BatchStatus::RolledBack);
    assert_eq!(harness.store.versions_for_batch(batch.id).len(), 1);
}

#[tokio::test]
async fn pending_and_rolled_back_batches_refuse() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    harness.stage_and_approve(mug, price(12.0));
    let batch_id = harness.engine.start_batch().unwrap()[0];

    let err = harness.engine.rollback(batch_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Core(CoreError::InvalidTransition { .. })));

    harness.engine.run_until_idle().await;
    harness.engine.rollback(batch_id).await.unwrap();
    let err = harness.engine.rollback(batch_id).await.unwrap_err();
    assert!(matches!(err, SyncError::Core(CoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn entity_can_be_staged_again_after_rollback() {
    let harness = TestHarness::new();
    let mug = harness.seed_product("MUG", 10.0);
    harness.stage_and_approve(mug, price(12.0));
    let batch = harness.sync_all().await.remove(0);
    harness.engine.rollback(batch.id).await.unwrap();

    harness.stage_and_approve(mug, price(14.0));
    let batches = harness.sync_all().await;
    assert_eq!(batches[0].stats.succeeded, 1);
    assert_eq!(harness.entity(mug).version, SEED_VERSION + 1);
}
