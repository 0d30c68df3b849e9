use std::time::Duration;

use locosync_core::{FileRef, ObjectKind, SyncObject, Syncable, needs_backup};
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::support::*;
use crate::drive::DriveEvent;
use crate::store::LocalStore;
use crate::sync::{ImportState, RunMode, RunOutcome};

#[tokio::test]
async fn full_runs_are_rate_limited() {
    let h = harness().await;
    assert!(h.engine.full_run_due());

    let outcome = h
        .engine
        .run_sync(RunMode::Full, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(h.engine.last_completed().is_some());
    assert!(!h.engine.full_run_due());

    let pending = h
        .store
        .commit(note(Uuid::new_v4(), "too soon", None).into())
        .await
        .unwrap();
    let outcome = h
        .engine
        .run_sync(RunMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(needs_backup(&stored(&h.store, &pending).await.unwrap()));

    // explicit backup runs are not rate limited
    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!needs_backup(&stored(&h.store, &pending).await.unwrap()));
}

#[tokio::test]
async fn expired_run_is_unfinished_and_asks_for_reschedule() {
    let h = harness().await;
    h.store
        .commit(note(Uuid::new_v4(), "late", None).into())
        .await
        .unwrap();
    let expiration = CancellationToken::new();
    expiration.cancel();

    let outcome = h.engine.run_sync(RunMode::Full, &expiration).await.unwrap();

    assert_eq!(outcome, RunOutcome::Unfinished);
    assert!(h.engine.last_completed().is_none());
    assert!(h.engine.take_reschedule_request());
    assert!(!h.engine.take_reschedule_request());
}

#[tokio::test]
async fn stalled_backup_gives_up_after_idle_ticks() {
    let h = harness().await;
    let stuck = h
        .store
        .commit(note(Uuid::new_v4(), "stuck", None).into())
        .await
        .unwrap();
    let file = FileRef::for_object(ObjectKind::Note, stuck.object_id());
    write_placeholder(&h.backup_root, &file);

    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Unfinished);
    assert!(h.engine.take_reschedule_request());
    assert_eq!(h.backup.pending_downloads(), vec![file.relative_path()]);
}

#[tokio::test]
async fn drive_events_are_coalesced_into_one_import() {
    let h = harness().await;
    let incoming: SyncObject = note(
        Uuid::new_v4(),
        "synced in",
        Some(datetime!(2024-01-16 12:00 UTC)),
    )
    .into();
    let file = write_object(&h.backup_root, &incoming);

    for _ in 0..3 {
        h.engine.handle_drive_event(DriveEvent::Changed {
            paths: vec![file.relative_path()],
        });
    }
    h.engine.handle_drive_event(DriveEvent::GatheringFinished);
    assert!(stored(&h.store, &incoming).await.is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(stored(&h.store, &incoming).await.is_some());
    let task = h.engine.task(&file).unwrap();
    assert_eq!(task.state, ImportState::Finished);
    assert_eq!(task.succeeded, 1);
}

#[tokio::test]
async fn continuation_after_unfinished_run_reopens_store() {
    let h = file_harness().await;
    let stuck = h
        .store
        .commit(note(Uuid::new_v4(), "stuck", None).into())
        .await
        .unwrap();
    let file = FileRef::for_object(ObjectKind::Note, stuck.object_id());
    write_placeholder(&h.backup_root, &file);

    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Unfinished);
    assert!(h.store.is_closed());

    std::fs::remove_file(h.backup_root.join(file.placeholder_path())).unwrap();
    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(!needs_backup(&stored(&h.store, &stuck).await.unwrap()));
    assert!(h.backup_root.join(file.relative_path()).exists());
}
