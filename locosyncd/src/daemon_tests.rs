use super::*;
use crate::sync::ImportState;
use locosync_core::{
    FileRef, ItemType, ObjectKind, SyncObject, SyncStamp, Syncable, TimelineItem, encode_object,
};
use tempfile::tempdir;
use time::macros::datetime;
use uuid::Uuid;

fn config_in(dir: &Path) -> DaemonConfig {
    DaemonConfig {
        backup_root: dir.join("backup"),
        data_dir: dir.join("data"),
        sync_interval: Duration::from_secs(60),
        run_budget: Duration::from_secs(30),
        min_run_interval: Duration::from_secs(3600),
        enable_watcher: false,
    }
}

#[test]
fn expands_tilde_to_home_backup_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/LocoSync Backups", &home),
        PathBuf::from("/tmp/home-user/LocoSync Backups")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/backups", &home), PathBuf::from("/srv/backups"));
}

#[test]
fn reads_intervals_from_env_or_default() {
    assert_eq!(read_u64_env("NO_SUCH_LOCOSYNC_ENV_FOR_TEST", 42), 42);
}

#[test]
fn watcher_is_enabled_by_default() {
    assert!(read_bool_env("NO_SUCH_LOCOSYNC_BOOL_FOR_TEST", true));
}

#[test]
fn data_files_live_under_data_dir() {
    let config = config_in(Path::new("/tmp/locosync-test"));
    assert_eq!(
        config.database_path(),
        PathBuf::from("/tmp/locosync-test/data/locosync.sqlite")
    );
    assert_eq!(
        config.import_dir(),
        PathBuf::from("/tmp/locosync-test/data/import")
    );
}

#[tokio::test]
async fn run_state_round_trips_and_tolerates_garbage() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(RUN_STATE_FILE);
    assert_eq!(load_run_state(&path).await.unwrap(), RunState::default());

    let state = RunState {
        last_completed: Some(datetime!(2024-06-01 12:00 UTC)),
    };
    save_run_state(&path, &state).await.unwrap();
    assert_eq!(load_run_state(&path).await.unwrap(), state);
    assert!(!path.with_extension("json.partial").exists());

    std::fs::write(&path, b"not json").unwrap();
    assert_eq!(load_run_state(&path).await.unwrap(), RunState::default());
}

#[test]
fn error_log_lists_each_file_once() {
    let file = FileRef::for_object(ObjectKind::Note, Uuid::nil());
    let text = format_error_log(&[ErrorLogEntry {
        file: file.clone(),
        state: ImportState::Errored,
        errors: vec!["unreadable file: eof".into()],
        can_ignore_missing: true,
    }]);
    assert!(text.starts_with(&format!("{file} [errored]\n")));
    assert!(text.contains("  - unreadable file: eof\n"));
    assert!(text.contains("ignoring missing dependents"));
}

#[tokio::test]
async fn run_once_on_empty_folders_completes_and_records_state() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let state_path = config.run_state_path();
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();

    let outcome = runtime.run_once().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    let state = load_run_state(&state_path).await.unwrap();
    assert!(state.last_completed.is_some());
}

#[tokio::test]
async fn retry_ignoring_missing_imports_orphaned_items() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    let backup_root = config.backup_root.clone();
    let item = SyncObject::TimelineItem(TimelineItem {
        id: Uuid::new_v4(),
        item_type: ItemType::Visit,
        start_date: datetime!(2024-06-01 09:00 UTC),
        end_date: datetime!(2024-06-01 10:00 UTC),
        place_id: Some(Uuid::new_v4()),
        activity_type: None,
        stamp: SyncStamp {
            last_saved: Some(datetime!(2024-06-01 10:05 UTC)),
            backup_synced_at: None,
        },
    });
    let file = FileRef::for_object(ObjectKind::TimelineItem, item.object_id());
    let path = backup_root.join(file.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, encode_object(&item).unwrap()).unwrap();

    let runtime = DaemonRuntime::bootstrap(config.clone()).await.unwrap();
    let report = runtime.retry(RetryScope::Errored).await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(report.remaining.len(), 1);
    assert!(report.remaining[0].can_ignore_missing);

    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    let engine = runtime.engine().clone();
    let report = runtime.retry(RetryScope::IgnoringMissing).await.unwrap();

    assert_eq!(report.retried, 1);
    assert!(report.remaining.is_empty());
    assert_eq!(engine.task(&file).unwrap().state, ImportState::Finished);
    assert!(
        engine
            .store()
            .get(ObjectKind::TimelineItem, item.object_id())
            .await
            .unwrap()
            .is_some()
    );
}
