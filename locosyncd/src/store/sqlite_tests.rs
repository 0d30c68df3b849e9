use super::*;
use locosync_core::{ItemType, Note, Place, Sample, SyncStamp, TimelineItem, needs_backup};
use time::macros::datetime;

async fn store() -> SqliteStore {
    SqliteStore::in_memory().await.unwrap()
}

fn place(external_id: Option<&str>) -> SyncObject {
    SyncObject::Place(Place {
        id: Uuid::new_v4(),
        name: "Home".into(),
        latitude: 35.68,
        longitude: 139.69,
        radius: 40.0,
        external_id: external_id.map(str::to_string),
        stamp: SyncStamp::default(),
    })
}

fn visit(place_id: Uuid) -> SyncObject {
    SyncObject::TimelineItem(TimelineItem {
        id: Uuid::new_v4(),
        item_type: ItemType::Visit,
        start_date: datetime!(2024-05-01 08:00 UTC),
        end_date: datetime!(2024-05-01 12:00 UTC),
        place_id: Some(place_id),
        activity_type: None,
        stamp: SyncStamp::default(),
    })
}

fn sample_at(date: Timestamp) -> SyncObject {
    SyncObject::Sample(Sample {
        id: Uuid::new_v4(),
        date,
        item_id: None,
        latitude: 1.0,
        longitude: 2.0,
        altitude: None,
        horizontal_accuracy: None,
        speed: None,
        course: None,
        activity_type: None,
        stamp: SyncStamp::default(),
    })
}

#[tokio::test]
async fn commit_stamps_missing_last_saved() {
    let store = store().await;
    let committed = store.commit(place(None)).await.unwrap();
    assert!(committed.last_saved().is_some());

    let loaded = store
        .get(ObjectKind::Place, committed.object_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, committed);
}

#[tokio::test]
async fn commit_keeps_carried_last_saved() {
    let store = store().await;
    let mut object = place(None);
    object.set_last_saved(Some(datetime!(2023-01-01 00:00:00.123456789 UTC)));
    let id = object.object_id();
    store.commit(object).await.unwrap();
    store.invalidate(ObjectKind::Place, id);

    let loaded = store.get(ObjectKind::Place, id).await.unwrap().unwrap();
    assert_eq!(
        loaded.last_saved(),
        Some(datetime!(2023-01-01 00:00:00.123456789 UTC))
    );
}

#[tokio::test]
async fn needs_backup_query_tracks_backup_stamp() {
    let store = store().await;
    let committed = store.commit(place(None)).await.unwrap();
    let query = StoreQuery::new().needs_backup();
    assert_eq!(store.count(ObjectKind::Place, &query).await.unwrap(), 1);

    let stamped = store
        .mark_backed_up(
            ObjectKind::Place,
            &[(committed.object_id(), committed.last_saved())],
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert_eq!(stamped, 1);
    assert_eq!(store.count(ObjectKind::Place, &query).await.unwrap(), 0);

    let loaded = store
        .get(ObjectKind::Place, committed.object_id())
        .await
        .unwrap()
        .unwrap();
    assert!(!needs_backup(&loaded));
}

#[tokio::test]
async fn mark_backed_up_skips_rows_edited_since_serialization() {
    let store = store().await;
    let committed = store.commit(place(None)).await.unwrap();
    let serialized = committed.last_saved();

    let mut edited = committed.clone();
    edited.set_last_saved(Some(datetime!(2030-01-01 00:00 UTC)));
    store.commit(edited).await.unwrap();

    let stamped = store
        .mark_backed_up(
            ObjectKind::Place,
            &[(committed.object_id(), serialized)],
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert_eq!(stamped, 0);
    let query = StoreQuery::new().needs_backup();
    assert_eq!(store.count(ObjectKind::Place, &query).await.unwrap(), 1);
}

#[tokio::test]
async fn with_visits_filters_unvisited_places() {
    let store = store().await;
    let visited = store.commit(place(None)).await.unwrap();
    store.commit(place(None)).await.unwrap();
    store.commit(visit(visited.object_id())).await.unwrap();

    let found = store
        .query(ObjectKind::Place, &StoreQuery::new().needs_backup().with_visits())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].object_id(), visited.object_id());
}

#[tokio::test]
async fn finds_places_by_external_id() {
    let store = store().await;
    let venue = store.commit(place(Some("4b0588"))).await.unwrap();
    store.commit(place(Some("other"))).await.unwrap();

    let found = store
        .query(ObjectKind::Place, &StoreQuery::new().external_id("4b0588"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].object_id(), venue.object_id());
}

#[tokio::test]
async fn starts_within_is_half_open_and_ordered() {
    let store = store().await;
    let objects = vec![
        sample_at(datetime!(2024-01-15 00:00 UTC)),
        sample_at(datetime!(2024-01-17 12:00 UTC)),
        sample_at(datetime!(2024-01-22 00:00 UTC)),
    ];
    store.commit_all(objects).await.unwrap();

    let query = StoreQuery::new().starts_within(
        datetime!(2024-01-15 00:00 UTC),
        datetime!(2024-01-22 00:00 UTC),
    );
    let found = store.query(ObjectKind::Sample, &query).await.unwrap();
    let dates: Vec<_> = found
        .iter()
        .filter_map(|object| object.as_sample().map(|sample| sample.date))
        .collect();
    assert_eq!(
        dates,
        vec![
            datetime!(2024-01-15 00:00 UTC),
            datetime!(2024-01-17 12:00 UTC)
        ]
    );

    let newest = store
        .query(ObjectKind::Sample, &StoreQuery::new().newest_first().limit(1))
        .await
        .unwrap();
    assert_eq!(
        newest[0].as_sample().map(|sample| sample.date),
        Some(datetime!(2024-01-22 00:00 UTC))
    );
}

#[tokio::test]
async fn invalidate_drops_cached_copy() {
    let store = store().await;
    let note = SyncObject::Note(Note {
        id: Uuid::new_v4(),
        date: datetime!(2024-02-02 10:00 UTC),
        body: "first".into(),
        stamp: SyncStamp::default(),
    });
    let committed = store.commit(note).await.unwrap();
    let id = committed.object_id();
    store.get(ObjectKind::Note, id).await.unwrap();

    sqlx::query("UPDATE objects SET body = replace(body, 'first', 'second') WHERE id = ?1")
        .bind(id.to_string())
        .execute(&store.current())
        .await
        .unwrap();
    let cached = store.get(ObjectKind::Note, id).await.unwrap().unwrap();
    assert!(matches!(cached, SyncObject::Note(ref note) if note.body == "first"));

    store.invalidate(ObjectKind::Note, id);
    let fresh = store.get(ObjectKind::Note, id).await.unwrap().unwrap();
    assert!(matches!(fresh, SyncObject::Note(ref note) if note.body == "second"));
}

#[tokio::test]
async fn close_waits_for_last_lease() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("objects.sqlite"))
        .await
        .unwrap();
    let lease = store.acquire();
    assert!(!store.close_if_idle().await);
    assert!(!store.is_closed());
    drop(lease);
    assert!(store.close_if_idle().await);
    assert!(store.is_closed());
    assert!(!store.close_if_idle().await);
}

#[tokio::test]
async fn closed_store_reopens_on_next_use() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("objects.sqlite"))
        .await
        .unwrap();
    let committed = store.commit(place(None)).await.unwrap();
    assert!(store.close_if_idle().await);

    store.invalidate(ObjectKind::Place, committed.object_id());
    let reread = store
        .get(ObjectKind::Place, committed.object_id())
        .await
        .unwrap();

    assert_eq!(reread, Some(committed));
    assert!(!store.is_closed());
}

#[tokio::test]
async fn in_memory_store_is_never_closed() {
    let store = store().await;
    assert!(!store.close_if_idle().await);
    assert!(!store.is_closed());
}
