//! Merge-tree upload behavior through the orchestrator.

mod common;

use common::harness::{TestHarness, make_parts, md5_hex, request_for};
use common::mocks::InstrumentedStore;
use futures::future::join_all;
use splice_core::keys::{parts_base, range_key};
use splice_core::{PartRange, StrategyKind, UploadState};
use splice_metadata::MetadataError;
use splice_storage::ObjectStore;
use splice_upload::{ComposeStrategy, MergeTreeStrategy, UploadError, UploadTarget};
use std::time::Duration;

fn range(lower: u32, upper: u32) -> PartRange {
    PartRange::new(lower, upper).unwrap()
}

#[tokio::test]
async fn test_eleven_parts_compose_into_one_object() {
    let harness = TestHarness::new().await;
    let parts = make_parts(11, 5, 3);
    let status = harness
        .initiate(&request_for("eleven.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    assert_eq!(status.total_parts, 11);
    assert_eq!(status.parts_state, "00000000000");

    harness.add_all(&status, &parts).await;

    let current = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap();
    assert_eq!(current.parts_state, "11111111111");

    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 53);
    assert_eq!(result.key, status.key);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());

    assert!(
        harness
            .orchestrator
            .list_ranges(status.upload_id)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(harness.leftover_part_objects(&status).await.is_empty());

    let done = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap();
    assert_eq!(done.state, UploadState::Completed);
    assert_eq!(done.result_size, Some(53));
}

#[tokio::test]
async fn test_ranges_stay_disjoint_while_parts_arrive_out_of_order() {
    let harness = TestHarness::new().await;
    let parts = make_parts(9, 4, 4);
    let status = harness
        .initiate(&request_for("shuffled.bin", &parts, 4, StrategyKind::MergeTree))
        .await;

    for n in [5u32, 1, 9, 2, 7, 3, 8, 4, 6] {
        let md5 = harness
            .put_part(&status, n, &parts[n as usize - 1])
            .await;
        harness
            .orchestrator
            .add_part(status.upload_id, n, &md5)
            .await
            .unwrap();

        let ranges = harness
            .orchestrator
            .list_ranges(status.upload_id)
            .await
            .unwrap();
        for (i, a) in ranges.iter().enumerate() {
            assert!(a.within(1, 9));
            for b in &ranges[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
    }

    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 36);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
}

#[tokio::test]
async fn test_add_part_twice_is_idempotent() {
    let harness = TestHarness::new().await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("twice.bin", &parts, 5, StrategyKind::MergeTree))
        .await;

    harness.add_all(&status, &parts[..1]).await;
    let ranges_before = harness
        .orchestrator
        .list_ranges(status.upload_id)
        .await
        .unwrap();

    harness
        .orchestrator
        .add_part(status.upload_id, 1, &md5_hex(&parts[0]))
        .await
        .unwrap();

    let after = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap();
    assert_eq!(after.parts_state, "100");
    assert_eq!(
        harness
            .orchestrator
            .list_ranges(status.upload_id)
            .await
            .unwrap(),
        ranges_before
    );
}

#[tokio::test]
async fn test_readding_merged_part_with_other_md5_is_rejected() {
    let harness = TestHarness::new().await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("remd5.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let upload_id = TestHarness::uuid(status.upload_id);
    harness.add_all(&status, &parts[..2]).await;
    assert_eq!(
        harness.store.list_ranges(upload_id).await.unwrap(),
        vec![range(1, 2)]
    );

    let other_md5 = md5_hex(b"not the first part");
    let err = harness
        .orchestrator
        .add_part(status.upload_id, 1, &other_md5)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Validation(_)));

    let recorded = harness
        .store
        .list_parts(upload_id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.part_number == 1)
        .unwrap();
    assert_eq!(recorded.part_md5, md5_hex(&parts[0]));
    assert_eq!(
        harness.store.list_ranges(upload_id).await.unwrap(),
        vec![range(1, 2)]
    );

    // The original checksum is still accepted as a repeat.
    harness
        .orchestrator
        .add_part(status.upload_id, 1, &md5_hex(&parts[0]))
        .await
        .unwrap();

    let md5 = harness.put_part(&status, 3, &parts[2]).await;
    harness
        .orchestrator
        .add_part(status.upload_id, 3, &md5)
        .await
        .unwrap();
    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 15);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
}

#[tokio::test]
async fn test_covered_part_without_record_is_checked_against_its_object() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("unrecorded.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let upload_id = TestHarness::uuid(status.upload_id);
    let md5 = harness.put_part(&status, 1, &parts[0]).await;
    harness.store.add_range(upload_id, range(1, 1)).await.unwrap();

    let strategy = MergeTreeStrategy::new(harness.store.clone(), harness.objects.clone());
    let session = harness.store.get_session(upload_id).await.unwrap().unwrap();
    let target = UploadTarget::from_session(&session).unwrap();

    let err = strategy
        .add_part(&target, 1, &md5_hex(b"something else"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Validation(_)));

    strategy.add_part(&target, 1, &md5).await.unwrap();
    assert_eq!(
        harness.store.list_ranges(upload_id).await.unwrap(),
        vec![range(1, 1)]
    );
}

#[tokio::test]
async fn test_metadata_calls_proceed_while_compose_is_in_flight() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("slow.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let other_parts = make_parts(2, 4, 4);
    let other = harness
        .initiate(&request_for("other.bin", &other_parts, 4, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts[..1]).await;
    let md5 = harness.put_part(&status, 2, &parts[1]).await;

    harness.objects.set_hold_compose(true);
    let orchestrator = harness.orchestrator.clone();
    let upload_id = status.upload_id;
    let merging = tokio::spawn(async move { orchestrator.add_part(upload_id, 2, &md5).await });
    harness.objects.compose_parked().await;
    harness.objects.set_hold_compose(false);

    let other_md5 = harness.put_part(&other, 1, &other_parts[0]).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        harness.orchestrator.add_part(other.upload_id, 1, &other_md5),
    )
    .await
    .expect("add_part waited on an unrelated compose")
    .unwrap();
    let ranges = tokio::time::timeout(
        Duration::from_secs(5),
        harness.store.list_ranges(TestHarness::uuid(upload_id)),
    )
    .await
    .expect("range lookup waited on compose")
    .unwrap();
    assert_eq!(ranges, vec![range(1, 1), range(2, 2)]);

    harness.objects.release_compose();
    merging.await.unwrap().unwrap();
    assert_eq!(
        harness
            .store
            .list_ranges(TestHarness::uuid(upload_id))
            .await
            .unwrap(),
        vec![range(1, 2)]
    );
}

#[tokio::test]
async fn test_concurrent_add_part_then_complete() {
    let harness = TestHarness::new().await;
    let parts = make_parts(16, 3, 2);
    let status = harness
        .initiate(&request_for("concurrent.bin", &parts, 3, StrategyKind::MergeTree))
        .await;

    let mut md5s = Vec::new();
    for (i, data) in parts.iter().enumerate() {
        md5s.push(harness.put_part(&status, i as u32 + 1, data).await);
    }

    let results = join_all(md5s.iter().enumerate().map(|(i, md5)| {
        let orchestrator = harness.orchestrator.clone();
        let upload_id = status.upload_id;
        let md5 = md5.clone();
        async move { orchestrator.add_part(upload_id, i as u32 + 1, &md5).await }
    }))
    .await;
    assert!(results.iter().all(Result::is_ok));

    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 47);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
    assert!(harness.leftover_part_objects(&status).await.is_empty());
}

#[tokio::test]
async fn test_md5_mismatch_is_rejected_and_recorded() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("mismatch.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.put_part(&status, 1, &parts[0]).await;

    let err = harness
        .orchestrator
        .add_part(status.upload_id, 1, &md5_hex(b"something else"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Validation(_)));

    let upload_id = TestHarness::uuid(status.upload_id);
    assert!(harness.store.list_ranges(upload_id).await.unwrap().is_empty());
    let errors = harness.store.list_part_errors(upload_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].part_number, 1);

    // A correct retry supersedes the error.
    harness
        .orchestrator
        .add_part(status.upload_id, 1, &md5_hex(&parts[0]))
        .await
        .unwrap();
    assert!(harness.store.list_part_errors(upload_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_add_part_without_uploaded_object_fails() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("absent.bin", &parts, 5, StrategyKind::MergeTree))
        .await;

    let err = harness
        .orchestrator
        .add_part(status.upload_id, 2, &md5_hex(&parts[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Validation(_)));
}

#[tokio::test]
async fn test_complete_with_missing_part_is_incomplete() {
    let harness = TestHarness::new().await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("gap.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts[..2]).await;

    let err = harness
        .orchestrator
        .complete(status.upload_id)
        .await
        .unwrap_err();
    match err {
        UploadError::IncompleteUpload { reason, .. } => assert!(reason.contains('3'), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_drain_without_full_span_is_incomplete() {
    let harness = TestHarness::new().await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("hole.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let upload_id = TestHarness::uuid(status.upload_id);

    // Ranges [1,1] and [3,3] can never meet.
    harness.put_part(&status, 1, &parts[0]).await;
    harness.put_part(&status, 3, &parts[2]).await;
    harness.store.add_range(upload_id, range(1, 1)).await.unwrap();
    harness.store.add_range(upload_id, range(3, 3)).await.unwrap();

    let strategy = MergeTreeStrategy::new(harness.store.clone(), harness.objects.clone());
    let session = harness.store.get_session(upload_id).await.unwrap().unwrap();
    let target = UploadTarget::from_session(&session).unwrap();
    let err = strategy.complete(&target).await.unwrap_err();
    assert!(matches!(err, UploadError::IncompleteUpload { .. }));
    assert_eq!(harness.objects.compose_count(), 0);
}

#[tokio::test]
async fn test_complete_resumes_after_unrecorded_finalize() {
    let harness = TestHarness::new().await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("resume.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts).await;
    let upload_id = TestHarness::uuid(status.upload_id);

    // Finalize through the strategy alone, leaving the session UPLOADING.
    let strategy = MergeTreeStrategy::new(harness.store.clone(), harness.objects.clone());
    let session = harness.store.get_session(upload_id).await.unwrap().unwrap();
    let target = UploadTarget::from_session(&session).unwrap();
    assert_eq!(strategy.complete(&target).await.unwrap(), 15);
    assert!(harness.store.list_ranges(upload_id).await.unwrap().is_empty());
    let pending = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap();
    assert_eq!(pending.state, UploadState::Uploading);

    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 15);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
    let done = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap();
    assert_eq!(done.state, UploadState::Completed);
}

#[tokio::test]
async fn test_complete_resumes_after_rename_without_row_removal() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("renamed.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts).await;
    let upload_id = TestHarness::uuid(status.upload_id);
    assert_eq!(
        harness.store.list_ranges(upload_id).await.unwrap(),
        vec![range(1, 2)]
    );

    let full_key = range_key(&parts_base(&status.key), &range(1, 2));
    harness
        .objects
        .rename(&status.bucket, &full_key, &status.key)
        .await
        .unwrap();

    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 10);
    assert!(harness.store.list_ranges(upload_id).await.unwrap().is_empty());
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
}

#[tokio::test]
async fn test_complete_fails_fast_on_held_lock() {
    let harness = TestHarness::with_config(|c| c.merge_attempts_per_part = 0).await;
    let parts = make_parts(3, 5, 5);
    let status = harness
        .initiate(&request_for("locked.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts).await;
    let upload_id = TestHarness::uuid(status.upload_id);
    assert_eq!(harness.store.list_ranges(upload_id).await.unwrap().len(), 3);

    let guard = harness
        .store
        .range_locks()
        .try_acquire(upload_id, &[range(1, 1)])
        .unwrap();
    let err = harness
        .orchestrator
        .complete(status.upload_id)
        .await
        .unwrap_err();
    assert!(err.is_lock_contention());
    assert_eq!(harness.objects.compose_count(), 0);

    drop(guard);
    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 15);
}

#[tokio::test]
async fn test_add_part_skips_locked_merges() {
    let harness = TestHarness::new().await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("skip.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let upload_id = TestHarness::uuid(status.upload_id);

    let guard = harness
        .store
        .range_locks()
        .try_acquire(upload_id, &[range(1, 1)])
        .unwrap();
    harness.add_all(&status, &parts).await;
    assert_eq!(
        harness.store.list_ranges(upload_id).await.unwrap(),
        vec![range(1, 1), range(2, 2)]
    );

    drop(guard);
    harness.orchestrator.complete(status.upload_id).await.unwrap();
}

#[tokio::test]
async fn test_compose_failure_during_add_part_is_tolerated() {
    let harness = TestHarness::new().await;
    let parts = make_parts(4, 5, 5);
    let status = harness
        .initiate(&request_for("flaky.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    let upload_id = TestHarness::uuid(status.upload_id);

    harness.objects.set_fail_compose(true);
    harness.add_all(&status, &parts).await;
    assert!(harness.objects.compose_count() > 0);
    assert_eq!(harness.store.list_ranges(upload_id).await.unwrap().len(), 4);

    // A failing compose during completion surfaces.
    let err = harness
        .orchestrator
        .complete(status.upload_id)
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Storage(_)));

    harness.objects.set_fail_compose(false);
    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 20);
}

#[tokio::test]
async fn test_failed_source_deletes_leave_garbage_only() {
    let harness = TestHarness::new().await;
    let parts = make_parts(4, 5, 5);
    let status = harness
        .initiate(&request_for("orphans.bin", &parts, 5, StrategyKind::MergeTree))
        .await;

    harness.objects.set_fail_delete(true);
    harness.add_all(&status, &parts).await;
    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();

    assert_eq!(result.size, 20);
    assert_eq!(harness.object(&status).await.unwrap(), parts.concat());
    assert!(!harness.leftover_part_objects(&status).await.is_empty());
}

#[tokio::test]
async fn test_abort_removes_ranges_objects_and_session() {
    let harness = TestHarness::new().await;
    let parts = make_parts(5, 5, 5);
    let status = harness
        .initiate(&request_for("abort.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts[..3]).await;
    // An uploaded part that was never added.
    harness.put_part(&status, 5, &parts[4]).await;

    harness.orchestrator.abort(status.upload_id).await.unwrap();

    let upload_id = TestHarness::uuid(status.upload_id);
    assert!(harness.store.list_ranges(upload_id).await.unwrap().is_empty());
    assert!(harness.leftover_part_objects(&status).await.is_empty());
    assert!(harness.store.get_session(upload_id).await.unwrap().is_none());
    let err = harness
        .orchestrator
        .get_status(status.upload_id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_abort_fails_on_held_lock() {
    let harness = TestHarness::with_config(|c| c.merge_attempts_per_part = 0).await;
    let parts = make_parts(2, 5, 5);
    let status = harness
        .initiate(&request_for("busy.bin", &parts, 5, StrategyKind::MergeTree))
        .await;
    harness.add_all(&status, &parts).await;
    let upload_id = TestHarness::uuid(status.upload_id);

    let guard = harness
        .store
        .range_locks()
        .try_acquire(upload_id, &[range(2, 2)])
        .unwrap();
    let err = harness.orchestrator.abort(status.upload_id).await.unwrap_err();
    assert!(err.is_lock_contention());
    assert!(harness.store.get_session(upload_id).await.unwrap().is_some());

    drop(guard);
    harness.orchestrator.abort(status.upload_id).await.unwrap();
    assert!(matches!(
        harness.store.record_part_success(upload_id, 1, "m1").await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_single_part_upload() {
    let harness = TestHarness::build(InstrumentedStore::compose_only(), |_| {}).await;
    let parts = make_parts(1, 7, 7);
    let status = harness
        .initiate(&request_for("single.bin", &parts, 10, StrategyKind::MergeTree))
        .await;
    assert_eq!(status.total_parts, 1);

    harness.add_all(&status, &parts).await;
    let result = harness.orchestrator.complete(status.upload_id).await.unwrap();
    assert_eq!(result.size, 7);
    assert_eq!(harness.objects.compose_count(), 0);
}
