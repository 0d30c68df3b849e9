use locosync_core::{
    CodecError, FileRef, ItemType, ObjectKind, Place, SyncObject, SyncStamp, Syncable,
    TimelineItem, decode_object, encode_object,
};
use time::macros::datetime;
use uuid::Uuid;

fn visit(place_id: Uuid) -> TimelineItem {
    TimelineItem {
        id: Uuid::new_v4(),
        item_type: ItemType::Visit,
        start_date: datetime!(2024-03-01 09:00 UTC),
        end_date: datetime!(2024-03-01 17:30 UTC),
        place_id: Some(place_id),
        activity_type: Some("stationary".into()),
        stamp: SyncStamp {
            last_saved: Some(datetime!(2024-03-01 17:31:02.25 UTC)),
            backup_synced_at: Some(datetime!(2024-03-01 17:40 UTC)),
        },
    }
}

#[test]
fn encoded_objects_keep_last_saved_but_not_backup_state() {
    let item = visit(Uuid::new_v4());
    let bytes = encode_object(&SyncObject::TimelineItem(item.clone())).unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.contains("\"lastSaved\": \"2024-03-01T17:31:02.25Z\""));
    assert!(!text.contains("backupSyncedAt"));
    assert!(text.ends_with('\n'));

    let decoded = decode_object(ObjectKind::TimelineItem, &bytes).unwrap();
    assert_eq!(decoded.object_id(), item.id);
    assert_eq!(decoded.last_saved(), item.stamp.last_saved);
    assert_eq!(decoded.backup_synced_at(), None);
    assert_eq!(decoded.parent().map(|p| p.id), item.place_id);
}

#[test]
fn missing_required_field_is_a_decode_error() {
    let json = br#"{"name": "Home", "latitude": 1.0, "longitude": 2.0, "radius": 30.0}"#;
    assert!(matches!(
        decode_object(ObjectKind::Place, json),
        Err(CodecError::Json(_))
    ));
}

#[test]
fn objects_without_last_saved_decode() {
    let id = Uuid::new_v4();
    let json = format!(
        r#"{{"id": "{id}", "name": "Cafe", "latitude": 1.0, "longitude": 2.0, "radius": 20.0, "externalId": "4b0588"}}"#
    );
    let decoded = decode_object(ObjectKind::Place, json.as_bytes()).unwrap();
    let SyncObject::Place(Place {
        external_id,
        stamp,
        ..
    }) = decoded
    else {
        panic!("expected a place");
    };
    assert_eq!(external_id.as_deref(), Some("4b0588"));
    assert_eq!(stamp.last_saved, None);
}

#[test]
fn file_refs_point_back_at_their_object() {
    let item = visit(Uuid::new_v4());
    let file = FileRef::for_object(ObjectKind::TimelineItem, item.id);
    let parsed = FileRef::parse_path(&file.placeholder_path()).unwrap();
    assert!(parsed.placeholder);
    assert_eq!(parsed.file.object_id(), Some(item.id));
    assert_eq!(
        file.to_string(),
        format!("TimelineItem/{}.json", item.id)
    );
}
