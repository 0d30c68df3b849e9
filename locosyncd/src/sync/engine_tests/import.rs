use locosync_core::{FileRef, IsoWeek, ObjectKind, ParentRef, SyncObject, Syncable};
use time::macros::datetime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::support::*;
use crate::store::{LocalStore, StoreQuery};
use crate::sync::{ImportError, ImportOptions, ImportState, RunMode, RunOutcome, SyncError};

#[tokio::test]
async fn new_object_is_inserted_with_fresh_stamp() {
    let h = harness().await;
    let incoming: SyncObject = note(
        Uuid::new_v4(),
        "from the other phone",
        Some(datetime!(2024-01-10 08:00 UTC)),
    )
    .into();
    let file = write_object(&h.backup_root, &incoming);

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    let local = stored(&h.store, &incoming).await.unwrap();
    match &local {
        SyncObject::Note(note) => assert_eq!(note.body, "from the other phone"),
        other => panic!("unexpected object {other:?}"),
    }
    assert!(local.backup_synced_at().is_none());
    assert!(local.last_saved().unwrap() > datetime!(2024-01-10 08:00 UTC));

    let task = h.engine.task(&file).unwrap();
    assert_eq!((task.succeeded, task.existing, task.errored), (1, 0, 0));
    assert_eq!(task.total_units, Some(1));
}

#[tokio::test]
async fn importing_twice_leaves_store_alone() {
    let h = harness().await;
    let incoming: SyncObject = note(
        Uuid::new_v4(),
        "again",
        Some(datetime!(2024-01-10 08:00 UTC)),
    )
    .into();
    let file = write_object(&h.backup_root, &incoming);
    h.engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();
    let first = stored(&h.store, &incoming).await.unwrap();

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    let task = h.engine.task(&file).unwrap();
    assert_eq!((task.succeeded, task.existing), (0, 1));
    assert_eq!(stored(&h.store, &incoming).await.unwrap(), first);
}

#[tokio::test]
async fn equal_stamp_keeps_local_copy() {
    let h = harness().await;
    let id = Uuid::new_v4();
    let saved = datetime!(2024-01-16 11:00 UTC);
    let local = h
        .store
        .commit(visit(id, None, Some(saved)).into())
        .await
        .unwrap();
    let mut incoming = visit(id, None, Some(saved));
    incoming.activity_type = Some("cycling".into());
    let file = write_object(&h.backup_root, &incoming.into());

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    assert_eq!(h.engine.task(&file).unwrap().existing, 1);
    assert_eq!(stored(&h.store, &local).await.unwrap(), local);
}

#[tokio::test]
async fn newer_copy_wins_and_older_never_rolls_back() {
    let h = harness().await;
    let id = Uuid::new_v4();
    h.store
        .commit(note(id, "local", Some(datetime!(2100-01-01 00:00 UTC))).into())
        .await
        .unwrap();

    let file = write_object(
        &h.backup_root,
        &note(id, "newer", Some(datetime!(2100-01-02 00:00 UTC))).into(),
    );
    h.engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();
    let after_newer = h.store.get(ObjectKind::Note, id).await.unwrap().unwrap();
    assert_eq!(after_newer.last_saved(), Some(datetime!(2100-01-02 00:00 UTC)));

    write_object(
        &h.backup_root,
        &note(id, "older", Some(datetime!(2099-12-31 00:00 UTC))).into(),
    );
    h.engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    match h.store.get(ObjectKind::Note, id).await.unwrap().unwrap() {
        SyncObject::Note(note) => {
            assert_eq!(note.body, "newer");
            assert_eq!(note.stamp.last_saved, Some(datetime!(2100-01-02 00:00 UTC)));
        }
        other => panic!("unexpected object {other:?}"),
    }
}

#[tokio::test]
async fn incoming_without_stamp_is_rejected() {
    let h = harness().await;
    let id = Uuid::new_v4();
    h.store
        .commit(note(id, "local", Some(datetime!(2024-01-16 12:00 UTC))).into())
        .await
        .unwrap();
    let file = write_object(&h.backup_root, &note(id, "unstamped", None).into());

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Errored);
    let task = h.engine.task(&file).unwrap();
    assert_eq!(task.errors, vec![ImportError::StaleWriteRejected { id }]);
}

#[tokio::test]
async fn missing_parent_errors_until_ignored() {
    let h = harness().await;
    let place_id = Uuid::new_v4();
    let visit_id = Uuid::new_v4();
    let file = write_object(
        &h.backup_root,
        &visit(visit_id, Some(place_id), Some(datetime!(2024-01-16 11:00 UTC))).into(),
    );

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Errored);
    let parent = ParentRef {
        kind: ObjectKind::Place,
        id: place_id,
    };
    let task = h.engine.task(&file).unwrap();
    assert_eq!(
        task.errors,
        vec![ImportError::MissingDependentFile {
            parent,
            child: visit_id,
        }]
    );
    assert_eq!(h.engine.missing_parents(), vec![parent]);
    let log = h.engine.error_log();
    assert_eq!(log.len(), 1);
    assert!(log[0].can_ignore_missing);
    assert!(h.store.get(ObjectKind::TimelineItem, visit_id).await.unwrap().is_none());

    assert_eq!(h.engine.retry_ignoring_missing(), 1);
    let outcome = h
        .engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.engine.task(&file).unwrap().state, ImportState::Finished);
    match h.store.get(ObjectKind::TimelineItem, visit_id).await.unwrap() {
        Some(SyncObject::TimelineItem(item)) => assert_eq!(item.place_id, None),
        other => panic!("unexpected object {other:?}"),
    }
}

#[tokio::test]
async fn ignoring_missing_parents_covers_one_import_only() {
    let h = harness().await;
    let week: IsoWeek = "2024-W03".parse().unwrap();
    let saved = Some(datetime!(2024-01-18 09:00 UTC));
    let first = sample(Some(Uuid::new_v4()), datetime!(2024-01-16 08:00 UTC), saved);
    let file = write_week(&h.backup_root, week, vec![first.clone()]);

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(state, ImportState::Errored);
    assert_eq!(h.engine.retry_ignoring_missing(), 1);
    h.engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();
    let task = h.engine.task(&file).unwrap();
    assert_eq!(task.state, ImportState::Finished);
    assert!(!task.options.ignore_missing);

    // a later version of the week references another absent item
    let later_item = Uuid::new_v4();
    let second = sample(Some(later_item), datetime!(2024-01-17 08:00 UTC), saved);
    write_week(&h.backup_root, week, vec![first, second.clone()]);

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Errored);
    let later_parent = ParentRef {
        kind: ObjectKind::TimelineItem,
        id: later_item,
    };
    let task = h.engine.task(&file).unwrap();
    assert!(task.errors.contains(&ImportError::MissingDependentFile {
        parent: later_parent,
        child: second.id,
    }));
    assert!(h.engine.missing_parents().contains(&later_parent));
    assert!(stored(&h.store, &second.into()).await.is_none());
}

#[tokio::test]
async fn parents_are_imported_before_children() {
    let h = harness().await;
    let place_id = Uuid::new_v4();
    let item_id = Uuid::new_v4();
    let saved = Some(datetime!(2024-01-16 11:00 UTC));
    write_object(&h.backup_root, &place(place_id, None, saved).into());
    write_object(&h.backup_root, &visit(item_id, Some(place_id), saved).into());
    let week = "2024-W03".parse().unwrap();
    let child = sample(Some(item_id), datetime!(2024-01-16 09:15 UTC), saved);
    let week_file = write_week(&h.backup_root, week, vec![child.clone()]);

    let state = h
        .engine
        .import_file(&week_file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    assert!(h.store.get(ObjectKind::Place, place_id).await.unwrap().is_some());
    assert!(h.store.get(ObjectKind::TimelineItem, item_id).await.unwrap().is_some());
    match stored(&h.store, &child.into()).await {
        Some(SyncObject::Sample(sample)) => assert_eq!(sample.item_id, Some(item_id)),
        other => panic!("unexpected object {other:?}"),
    }
    for file in [
        FileRef::for_object(ObjectKind::Place, place_id),
        FileRef::for_object(ObjectKind::TimelineItem, item_id),
    ] {
        assert_eq!(h.engine.task(&file).unwrap().state, ImportState::Finished);
    }
}

#[tokio::test]
async fn child_waits_for_parent_download() {
    let h = harness().await;
    let item_id = Uuid::new_v4();
    let saved = Some(datetime!(2024-01-16 11:00 UTC));
    let item: SyncObject = visit(item_id, None, saved).into();
    let item_file = FileRef::for_object(ObjectKind::TimelineItem, item_id);
    write_placeholder(&h.backup_root, &item_file);
    let child = sample(Some(item_id), datetime!(2024-01-16 09:15 UTC), saved);
    let week_file = write_week(&h.backup_root, "2024-W03".parse().unwrap(), vec![child.clone()]);

    let state = h
        .engine
        .import_file(&week_file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Waiting);
    let task = h.engine.task(&week_file).unwrap();
    assert_eq!(task.deferred, 1);
    assert!(task.downloading_dependents.contains(&item_file));
    assert_eq!(h.engine.task(&item_file).unwrap().state, ImportState::Downloading);
    assert_eq!(h.backup.pending_downloads(), vec![item_file.relative_path()]);
    assert!(stored(&h.store, &child.clone().into()).await.is_none());

    finish_download(&h.backup_root, &item_file, &item);
    let outcome = h
        .engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.engine.task(&week_file).unwrap().state, ImportState::Finished);
    assert!(stored(&h.store, &item).await.is_some());
    assert!(stored(&h.store, &child.into()).await.is_some());
}

#[tokio::test]
async fn cancelled_import_commits_nothing() {
    let h = harness().await;
    let incoming: SyncObject = note(
        Uuid::new_v4(),
        "half way",
        Some(datetime!(2024-01-10 08:00 UTC)),
    )
    .into();
    let file = write_object(&h.backup_root, &incoming);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.engine.import_queued(&file, &cancel).await;

    assert!(matches!(result, Err(SyncError::Cancelled)));
    let task = h.engine.task(&file).unwrap();
    assert_eq!(task.state, ImportState::Created);
    assert_eq!(task.processed(), 0);
    assert!(stored(&h.store, &incoming).await.is_none());
}

#[tokio::test]
async fn unreadable_file_lands_in_error_log() {
    let h = harness().await;
    let file = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
    let path = h.backup_root.join(file.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{\"id\": ").unwrap();

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Errored);
    let log = h.engine.error_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].file, file);
    assert!(log[0].errors[0].starts_with("unreadable file"));
    assert!(!log[0].can_ignore_missing);
}

#[tokio::test]
async fn errored_file_imports_after_user_retry() {
    let h = harness().await;
    let incoming: SyncObject =
        note(Uuid::new_v4(), "fixed by hand", Some(datetime!(2024-01-16 12:00 UTC))).into();
    let file = FileRef::for_object(ObjectKind::Note, incoming.object_id());
    let path = h.backup_root.join(file.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{\"id\": ").unwrap();

    let outcome = h
        .engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.engine.task(&file).unwrap().state, ImportState::Errored);

    // errored files stay put until someone asks again
    write_object(&h.backup_root, &incoming);
    h.engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.engine.task(&file).unwrap().state, ImportState::Errored);
    assert!(stored(&h.store, &incoming).await.is_none());

    assert_eq!(h.engine.retry_errored(), 1);
    h.engine
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    let task = h.engine.task(&file).unwrap();
    assert_eq!(task.state, ImportState::Finished);
    assert!(task.errors.is_empty());
    assert!(h.engine.error_log().is_empty());
    assert!(stored(&h.store, &incoming).await.is_some());
}

#[tokio::test]
async fn sample_moved_to_another_week_keeps_newer_local_copy() {
    let h = harness().await;
    let week: IsoWeek = "2024-W03".parse().unwrap();
    let mut local = sample(
        None,
        datetime!(2024-01-24 08:00 UTC),
        Some(datetime!(2024-02-01 08:00 UTC)),
    );
    h.store.commit(local.clone().into()).await.unwrap();

    // an older copy of the same sample, still dated in the previous week
    local.date = datetime!(2024-01-17 08:00 UTC);
    local.stamp.last_saved = Some(datetime!(2024-01-17 09:00 UTC));
    let file = write_week(&h.backup_root, week, vec![local.clone()]);

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    let task = h.engine.task(&file).unwrap();
    assert_eq!((task.succeeded, task.existing), (0, 1));
    match stored(&h.store, &local.into()).await {
        Some(SyncObject::Sample(kept)) => {
            assert_eq!(kept.date, datetime!(2024-01-24 08:00 UTC));
            assert_eq!(kept.stamp.last_saved, Some(datetime!(2024-02-01 08:00 UTC)));
        }
        other => panic!("unexpected object {other:?}"),
    }
}

#[tokio::test]
async fn summaries_merge_by_covered_range() {
    let h = harness().await;
    let local_id = Uuid::new_v4();
    h.store
        .commit(summary(local_id, Some(datetime!(2024-01-20 00:00 UTC))).into())
        .await
        .unwrap();
    let remote_id = Uuid::new_v4();
    let mut incoming = summary(remote_id, Some(datetime!(2024-01-21 00:00 UTC)));
    incoming.distance = 5400.0;
    let file = write_object(&h.backup_root, &incoming.into());

    let state = h
        .engine
        .import_file(&file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    assert!(h.store.get(ObjectKind::RangeSummary, remote_id).await.unwrap().is_none());
    match h.store.get(ObjectKind::RangeSummary, local_id).await.unwrap() {
        Some(SyncObject::RangeSummary(summary)) => assert_eq!(summary.distance, 5400.0),
        other => panic!("unexpected object {other:?}"),
    }
    let all = h
        .store
        .count(ObjectKind::RangeSummary, &StoreQuery::new())
        .await
        .unwrap();
    assert_eq!(all, 1);
}

#[tokio::test]
async fn places_merge_by_external_id() {
    let h = harness().await;
    let local_place = Uuid::new_v4();
    h.store
        .commit(place(local_place, Some("osm:node/42"), None).into())
        .await
        .unwrap();
    let remote_place = Uuid::new_v4();
    let visit_id = Uuid::new_v4();
    let saved = Some(datetime!(2024-01-16 11:00 UTC));
    let place_file = write_object(
        &h.backup_root,
        &place(remote_place, Some("osm:node/42"), saved).into(),
    );
    let visit_file = write_object(
        &h.backup_root,
        &visit(visit_id, Some(remote_place), saved).into(),
    );

    let state = h
        .engine
        .import_file(&visit_file, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(state, ImportState::Finished);
    match h.store.get(ObjectKind::TimelineItem, visit_id).await.unwrap() {
        Some(SyncObject::TimelineItem(item)) => assert_eq!(item.place_id, Some(local_place)),
        other => panic!("unexpected object {other:?}"),
    }

    let state = h
        .engine
        .import_file(&place_file, ImportOptions::default())
        .await
        .unwrap();
    assert_eq!(state, ImportState::Finished);
    assert_eq!(h.engine.task(&place_file).unwrap().existing, 1);
    assert!(h.store.get(ObjectKind::Place, remote_place).await.unwrap().is_none());
}

#[tokio::test]
async fn second_device_restores_what_first_backed_up() {
    let h = harness().await;
    let place_id = Uuid::new_v4();
    let item_id = Uuid::new_v4();
    let note_id = Uuid::new_v4();
    let child = sample(Some(item_id), datetime!(2024-01-16 09:30 UTC), None);
    h.store
        .commit_all(vec![
            place(place_id, Some("osm:way/7"), None).into(),
            visit(item_id, Some(place_id), None).into(),
            note(note_id, "round trip", None).into(),
            child.clone().into(),
        ])
        .await
        .unwrap();
    let outcome = h
        .engine
        .run_sync(RunMode::Backup, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let (store_b, engine_b) = h.second_device().await;
    let outcome = engine_b
        .run_sync(RunMode::Import, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    match store_b.get(ObjectKind::Note, note_id).await.unwrap() {
        Some(SyncObject::Note(note)) => assert_eq!(note.body, "round trip"),
        other => panic!("unexpected object {other:?}"),
    }
    match store_b.get(ObjectKind::TimelineItem, item_id).await.unwrap() {
        Some(SyncObject::TimelineItem(item)) => assert_eq!(item.place_id, Some(place_id)),
        other => panic!("unexpected object {other:?}"),
    }
    match stored(&store_b, &child.into()).await {
        Some(SyncObject::Sample(sample)) => assert_eq!(sample.item_id, Some(item_id)),
        other => panic!("unexpected object {other:?}"),
    }
    assert!(
        engine_b
            .tasks()
            .iter()
            .all(|task| task.state == ImportState::Finished)
    );
}
