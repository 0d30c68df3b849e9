use std::path::PathBuf;

use locosync_core::{FileRef, ObjectKind, SyncObject};
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::support::*;
use crate::drive::{CloudDrive, LocalDrive};
use crate::store::LocalStore;
use crate::sync::{ImportState, RestoreStatus, RunMode, RunOutcome, SyncError, TaskOrigin};

fn source_drive(h: &Harness) -> (PathBuf, LocalDrive) {
    let source = h.dir.path().join("old-phone");
    std::fs::create_dir_all(&source).unwrap();
    let drive = LocalDrive::new(&source, h.dir.path().join("staging"));
    (source, drive)
}

#[tokio::test]
async fn restore_copies_imports_and_cleans_up() {
    let h = harness().await;
    let (source, drive) = source_drive(&h);
    let export = source.join("Export");
    let place_id = Uuid::new_v4();
    let item_id = Uuid::new_v4();
    let saved = Some(datetime!(2023-06-01 10:00 UTC));
    let place_file = write_object(&export, &place(place_id, None, saved).into());
    let item_file = write_object(&export, &visit(item_id, Some(place_id), saved).into());
    std::fs::write(source.join("readme.txt"), b"old phone").unwrap();

    let status = h.engine.restore_from(&drive).await.unwrap();

    assert_eq!(status, RestoreStatus::Queued { files: 2 });
    let import_root = h.import.root().to_path_buf();
    for file in [&place_file, &item_file] {
        assert!(import_root.join(file.relative_path()).exists());
        assert!(!export.join(file.relative_path()).exists());
        let task = h.engine.task(file).unwrap();
        assert_eq!(task.state, ImportState::Queued);
        assert_eq!(task.options.origin, TaskOrigin::Restore);
        assert!(task.options.delete_on_finish);
    }

    let outcome = h
        .engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    match h.store.get(ObjectKind::TimelineItem, item_id).await.unwrap() {
        Some(SyncObject::TimelineItem(item)) => assert_eq!(item.place_id, Some(place_id)),
        other => panic!("unexpected object {other:?}"),
    }
    assert!(h.store.get(ObjectKind::Place, place_id).await.unwrap().is_some());
    for file in [&place_file, &item_file] {
        assert_eq!(h.engine.task(file).unwrap().state, ImportState::Finished);
        assert!(!import_root.join(file.relative_path()).exists());
    }
    assert!(source.join("readme.txt").exists());
}

#[tokio::test]
async fn restore_waits_for_placeholders() {
    let h = harness().await;
    let (source, drive) = source_drive(&h);
    let present = write_object(
        &source,
        &note(Uuid::new_v4(), "here", Some(datetime!(2023-06-01 10:00 UTC))).into(),
    );
    let offline = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
    write_placeholder(&source, &offline);

    let status = h.engine.restore_from(&drive).await.unwrap();

    assert_eq!(status, RestoreStatus::Downloading { pending: 1 });
    assert_eq!(drive.pending_downloads(), vec![offline.relative_path()]);
    assert!(source.join(present.relative_path()).exists());
    assert!(h.engine.tasks().is_empty());
}

#[tokio::test]
async fn restore_without_backup_files_fails() {
    let h = harness().await;
    let (source, drive) = source_drive(&h);
    std::fs::write(source.join("photo.jpg"), b"jpeg").unwrap();

    let result = h.engine.restore_from(&drive).await;

    assert!(matches!(result, Err(SyncError::NothingToRestore(_))));
}

#[tokio::test]
async fn restored_copies_survive_a_restart() {
    let h = harness().await;
    let (source, drive) = source_drive(&h);
    let incoming: SyncObject =
        note(Uuid::new_v4(), "from the old phone", Some(datetime!(2023-06-01 10:00 UTC))).into();
    let file = write_object(&source, &incoming);

    let status = h.engine.restore_from(&drive).await.unwrap();
    assert_eq!(status, RestoreStatus::Queued { files: 1 });
    assert!(!source.join(file.relative_path()).exists());

    // queued tasks live in memory only
    let engine = h.restarted();
    assert!(engine.task(&file).is_none());
    let outcome = engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(stored(&h.store, &incoming).await.is_some());
    let task = engine.task(&file).unwrap();
    assert_eq!(task.state, ImportState::Finished);
    assert_eq!(task.options.origin, TaskOrigin::Restore);
    assert!(!h.import.root().join(file.relative_path()).exists());
}
