use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use locosync_core::{
    FileRef, IsoWeek, ItemType, Note, Place, RangeSummary, Sample, SampleBatch, SyncObject,
    SyncStamp, Syncable, TimelineItem, Timestamp, encode_object, encode_sample_batch,
};
use tempfile::{TempDir, tempdir};
use uuid::Uuid;

use crate::drive::LocalDrive;
use crate::store::{LocalStore, SqliteStore};
use crate::sync::engine::SyncEngine;
use crate::sync::scheduler::SchedulerConfig;

pub(super) struct Harness {
    pub dir: TempDir,
    pub backup_root: PathBuf,
    pub store: Arc<SqliteStore>,
    pub backup: Arc<LocalDrive>,
    pub import: Arc<LocalDrive>,
    pub engine: SyncEngine,
}

impl Harness {
    /// Another device sharing the same backup folder, with its own store.
    pub async fn second_device(&self) -> (Arc<SqliteStore>, SyncEngine) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = SyncEngine::with_config(
            store.clone(),
            self.backup.clone(),
            Arc::new(LocalDrive::new(
                self.dir.path().join("import-b"),
                self.dir.path().join("staging-b"),
            )),
            fast_config(),
        );
        (store, engine)
    }

    /// The same store and drives after a process restart: no tasks in memory.
    pub fn restarted(&self) -> SyncEngine {
        SyncEngine::with_config(
            self.store.clone(),
            self.backup.clone(),
            self.import.clone(),
            fast_config(),
        )
    }
}

pub(super) fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        pool_concurrency: 2,
        batch_delay: Duration::from_millis(5),
        debounce: Duration::from_millis(20),
        max_idle_ticks: 3,
        min_run_interval: Duration::from_secs(3600),
    }
}

pub(super) async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = SqliteStore::in_memory().await.unwrap();
    harness_with(dir, store)
}

/// Backed by a database file, so an idle store really closes.
pub(super) async fn file_harness() -> Harness {
    let dir = tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("objects.sqlite"))
        .await
        .unwrap();
    harness_with(dir, store)
}

fn harness_with(dir: TempDir, store: SqliteStore) -> Harness {
    let store = Arc::new(store);
    let backup = Arc::new(LocalDrive::new(
        dir.path().join("backup"),
        dir.path().join("staging"),
    ));
    let import = Arc::new(LocalDrive::new(
        dir.path().join("import"),
        dir.path().join("staging"),
    ));
    let backup_root = dir.path().join("backup");
    std::fs::create_dir_all(&backup_root).unwrap();
    let engine = SyncEngine::with_config(
        store.clone(),
        backup.clone(),
        import.clone(),
        fast_config(),
    );
    Harness {
        dir,
        backup_root,
        store,
        backup,
        import,
        engine,
    }
}

pub(super) fn stamp(last_saved: Option<Timestamp>) -> SyncStamp {
    SyncStamp {
        last_saved,
        backup_synced_at: None,
    }
}

pub(super) fn place(id: Uuid, external_id: Option<&str>, last_saved: Option<Timestamp>) -> Place {
    Place {
        id,
        name: "Cafe".into(),
        latitude: 52.52,
        longitude: 13.40,
        radius: 25.0,
        external_id: external_id.map(str::to_string),
        stamp: stamp(last_saved),
    }
}

pub(super) fn note(id: Uuid, body: &str, last_saved: Option<Timestamp>) -> Note {
    Note {
        id,
        date: time::macros::datetime!(2024-01-16 12:00 UTC),
        body: body.into(),
        stamp: stamp(last_saved),
    }
}

pub(super) fn visit(id: Uuid, place_id: Option<Uuid>, last_saved: Option<Timestamp>) -> TimelineItem {
    TimelineItem {
        id,
        item_type: ItemType::Visit,
        start_date: time::macros::datetime!(2024-01-16 09:00 UTC),
        end_date: time::macros::datetime!(2024-01-16 10:00 UTC),
        place_id,
        activity_type: None,
        stamp: stamp(last_saved),
    }
}

pub(super) fn sample(item_id: Option<Uuid>, date: Timestamp, last_saved: Option<Timestamp>) -> Sample {
    Sample {
        id: Uuid::new_v4(),
        date,
        item_id,
        latitude: 52.5,
        longitude: 13.4,
        altitude: Some(34.0),
        horizontal_accuracy: Some(8.0),
        speed: None,
        course: None,
        activity_type: Some("stationary".into()),
        stamp: stamp(last_saved),
    }
}

pub(super) fn summary(id: Uuid, last_saved: Option<Timestamp>) -> RangeSummary {
    RangeSummary {
        id,
        start: time::macros::datetime!(2024-01-15 00:00 UTC),
        end: time::macros::datetime!(2024-01-22 00:00 UTC),
        distance: 1200.0,
        step_count: Some(9000),
        visit_count: 3,
        stamp: stamp(last_saved),
    }
}

/// Writes an object file the way another device would.
pub(super) fn write_object(root: &Path, object: &SyncObject) -> FileRef {
    let file = FileRef::for_object(object.kind(), object.object_id());
    let path = root.join(file.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, encode_object(object).unwrap()).unwrap();
    file
}

pub(super) fn write_week(root: &Path, week: IsoWeek, samples: Vec<Sample>) -> FileRef {
    let file = FileRef::for_week(week);
    let path = root.join(file.relative_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let bytes = encode_sample_batch(&SampleBatch::new(week, samples)).unwrap();
    std::fs::write(&path, bytes).unwrap();
    file
}

/// Leaves only the not-yet-downloaded marker for `file`.
pub(super) fn write_placeholder(root: &Path, file: &FileRef) {
    let _ = std::fs::remove_file(root.join(file.relative_path()));
    let path = root.join(file.placeholder_path());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"").unwrap();
}

/// Replaces the marker with the downloaded content.
pub(super) fn finish_download(root: &Path, file: &FileRef, object: &SyncObject) {
    std::fs::remove_file(root.join(file.placeholder_path())).unwrap();
    write_object(root, object);
}

pub(super) async fn stored(store: &SqliteStore, object: &SyncObject) -> Option<SyncObject> {
    store.get(object.kind(), object.object_id()).await.unwrap()
}
