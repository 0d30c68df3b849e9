use std::collections::HashSet;

use locosync_core::{
    FileRef, IsoWeek, ObjectKind, SyncObject, Syncable, decode_object, decode_sample_batch,
    needs_backup,
};
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::support::*;
use crate::store::LocalStore;
use crate::sync::change::{pending_count, pending_objects};
use crate::sync::scheduler::{RunMode, RunOutcome};

#[tokio::test]
async fn backup_object_writes_file_and_stamps_sync_time() {
    let h = harness().await;
    let note = h
        .store
        .commit(note(Uuid::new_v4(), "first coffee", None).into())
        .await
        .unwrap();

    assert!(h.engine.backup_object(&note).await.unwrap());

    let file = FileRef::for_object(ObjectKind::Note, note.object_id());
    let bytes = std::fs::read(h.backup_root.join(file.relative_path())).unwrap();
    let written = decode_object(ObjectKind::Note, &bytes).unwrap();
    assert_eq!(written.object_id(), note.object_id());
    assert_eq!(written.last_saved(), note.last_saved());
    assert!(!String::from_utf8(bytes).unwrap().contains("backupSyncedAt"));

    let local = stored(&h.store, &note).await.unwrap();
    assert!(local.backup_synced_at().is_some());
    assert!(!needs_backup(&local));
}

#[tokio::test]
async fn existing_file_is_replaced_in_place() {
    let h = harness().await;
    let id = Uuid::new_v4();
    write_object(
        &h.backup_root,
        &note(id, "old", Some(datetime!(2024-01-01 00:00 UTC))).into(),
    );
    let fresh = h.store.commit(note(id, "new", None).into()).await.unwrap();

    assert!(h.engine.backup_object(&fresh).await.unwrap());

    let file = FileRef::for_object(ObjectKind::Note, id);
    let bytes = std::fs::read(h.backup_root.join(file.relative_path())).unwrap();
    match decode_object(ObjectKind::Note, &bytes).unwrap() {
        SyncObject::Note(note) => assert_eq!(note.body, "new"),
        other => panic!("unexpected object {other:?}"),
    }
}

#[tokio::test]
async fn placeholder_destination_requests_download_and_stays_pending() {
    let h = harness().await;
    let note = h
        .store
        .commit(note(Uuid::new_v4(), "offline", None).into())
        .await
        .unwrap();
    let file = FileRef::for_object(ObjectKind::Note, note.object_id());
    write_placeholder(&h.backup_root, &file);

    assert!(!h.engine.backup_object(&note).await.unwrap());

    assert_eq!(h.backup.pending_downloads(), vec![file.relative_path()]);
    let local = stored(&h.store, &note).await.unwrap();
    assert!(needs_backup(&local));
}

#[tokio::test]
async fn week_backup_rewrites_whole_batch() {
    let h = harness().await;
    let week: IsoWeek = "2024-W03".parse().unwrap();
    let samples = vec![
        sample(None, datetime!(2024-01-16 08:00 UTC), None),
        sample(None, datetime!(2024-01-18 08:00 UTC), None),
        sample(None, datetime!(2024-01-23 08:00 UTC), None),
    ];
    h.store
        .commit_all(samples.into_iter().map(SyncObject::from).collect())
        .await
        .unwrap();

    assert!(h.engine.backup_week(week).await.unwrap());

    let path = h.backup_root.join(FileRef::for_week(week).relative_path());
    assert!(path.ends_with("LocomotionSample/2024/2024-W03.json.gz"));
    let batch = decode_sample_batch(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(batch.week, week);
    assert_eq!(batch.samples.len(), 2);

    let pending = pending_objects(h.store.as_ref(), ObjectKind::Sample, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        IsoWeek::containing(pending[0].as_sample().unwrap().date).to_string(),
        "2024-W04"
    );
}

#[tokio::test]
async fn backup_run_drains_every_pending_object() {
    let h = harness().await;
    let place_id = Uuid::new_v4();
    let item_id = Uuid::new_v4();
    h.store
        .commit_all(vec![
            place(place_id, None, None).into(),
            visit(item_id, Some(place_id), None).into(),
            note(Uuid::new_v4(), "walked home", None).into(),
            sample(Some(item_id), datetime!(2024-01-16 09:30 UTC), None).into(),
        ])
        .await
        .unwrap();

    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(pending_count(h.store.as_ref()).await.unwrap(), 0);
    for file in [
        FileRef::for_object(ObjectKind::Place, place_id),
        FileRef::for_object(ObjectKind::TimelineItem, item_id),
        FileRef::for_week("2024-W03".parse().unwrap()),
    ] {
        assert!(h.backup_root.join(file.relative_path()).exists(), "{file}");
    }
}
