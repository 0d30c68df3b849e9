use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub type Timestamp = OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Place,
    Note,
    TimelineItem,
    Sample,
    RangeSummary,
}

impl ObjectKind {
    /// Parents come before their children.
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::Place,
        ObjectKind::TimelineItem,
        ObjectKind::Note,
        ObjectKind::RangeSummary,
        ObjectKind::Sample,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Place => "place",
            ObjectKind::Note => "note",
            ObjectKind::TimelineItem => "timeline_item",
            ObjectKind::Sample => "sample",
            ObjectKind::RangeSummary => "range_summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "place" => Some(ObjectKind::Place),
            "note" => Some(ObjectKind::Note),
            "timeline_item" => Some(ObjectKind::TimelineItem),
            "sample" => Some(ObjectKind::Sample),
            "range_summary" => Some(ObjectKind::RangeSummary),
            _ => None,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            ObjectKind::Place => "Place",
            ObjectKind::Note => "Note",
            ObjectKind::TimelineItem => "TimelineItem",
            ObjectKind::Sample => "LocomotionSample",
            ObjectKind::RangeSummary => "TimelineRangeSummary",
        }
    }

    pub fn from_dir_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.dir_name() == value)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentRef {
    pub kind: ObjectKind,
    pub id: Uuid,
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Sync bookkeeping carried by every persisted entity.
///
/// `backup_synced_at` is local state and is never written into backup files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStamp {
    #[serde(
        with = "time::serde::rfc3339::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_saved: Option<Timestamp>,
    #[serde(skip)]
    pub backup_synced_at: Option<Timestamp>,
}

pub trait Syncable {
    fn kind(&self) -> ObjectKind;
    fn object_id(&self) -> Uuid;
    fn stamp(&self) -> &SyncStamp;
    fn stamp_mut(&mut self) -> &mut SyncStamp;

    fn parent(&self) -> Option<ParentRef> {
        None
    }

    fn sever_parent(&mut self) {}

    fn reassign_parent(&mut self, _id: Uuid) {}

    fn last_saved(&self) -> Option<Timestamp> {
        self.stamp().last_saved
    }

    fn backup_synced_at(&self) -> Option<Timestamp> {
        self.stamp().backup_synced_at
    }
}

pub fn needs_backup<T: Syncable + ?Sized>(object: &T) -> bool {
    match (object.backup_synced_at(), object.last_saved()) {
        (None, _) => true,
        (Some(synced), Some(saved)) => synced < saved,
        (Some(_), None) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: Uuid,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    /// Venue id from the external places service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(flatten)]
    pub stamp: SyncStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub date: Timestamp,
    pub body: String,
    #[serde(flatten)]
    pub stamp: SyncStamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Visit,
    Path,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineItem {
    pub id: Uuid,
    pub item_type: ItemType,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(flatten)]
    pub stamp: SyncStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub date: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_type: Option<String>,
    #[serde(flatten)]
    pub stamp: SyncStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeSummary {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub start: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub end: Timestamp,
    #[serde(default)]
    pub distance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<i64>,
    #[serde(default)]
    pub visit_count: u32,
    #[serde(flatten)]
    pub stamp: SyncStamp,
}

impl Syncable for Place {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Place
    }

    fn object_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> &SyncStamp {
        &self.stamp
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        &mut self.stamp
    }
}

impl Syncable for Note {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Note
    }

    fn object_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> &SyncStamp {
        &self.stamp
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        &mut self.stamp
    }
}

impl Syncable for TimelineItem {
    fn kind(&self) -> ObjectKind {
        ObjectKind::TimelineItem
    }

    fn object_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> &SyncStamp {
        &self.stamp
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        &mut self.stamp
    }

    fn parent(&self) -> Option<ParentRef> {
        if self.item_type != ItemType::Visit {
            return None;
        }
        self.place_id.map(|id| ParentRef {
            kind: ObjectKind::Place,
            id,
        })
    }

    fn sever_parent(&mut self) {
        self.place_id = None;
    }

    fn reassign_parent(&mut self, id: Uuid) {
        if self.item_type == ItemType::Visit {
            self.place_id = Some(id);
        }
    }
}

impl Syncable for Sample {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Sample
    }

    fn object_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> &SyncStamp {
        &self.stamp
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        &mut self.stamp
    }

    fn parent(&self) -> Option<ParentRef> {
        self.item_id.map(|id| ParentRef {
            kind: ObjectKind::TimelineItem,
            id,
        })
    }

    fn sever_parent(&mut self) {
        self.item_id = None;
    }

    fn reassign_parent(&mut self, id: Uuid) {
        self.item_id = Some(id);
    }
}

impl Syncable for RangeSummary {
    fn kind(&self) -> ObjectKind {
        ObjectKind::RangeSummary
    }

    fn object_id(&self) -> Uuid {
        self.id
    }

    fn stamp(&self) -> &SyncStamp {
        &self.stamp
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        &mut self.stamp
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncObject {
    Place(Place),
    Note(Note),
    TimelineItem(TimelineItem),
    Sample(Sample),
    RangeSummary(RangeSummary),
}

macro_rules! dispatch {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            SyncObject::Place($inner) => $body,
            SyncObject::Note($inner) => $body,
            SyncObject::TimelineItem($inner) => $body,
            SyncObject::Sample($inner) => $body,
            SyncObject::RangeSummary($inner) => $body,
        }
    };
}

impl Syncable for SyncObject {
    fn kind(&self) -> ObjectKind {
        dispatch!(self, inner => inner.kind())
    }

    fn object_id(&self) -> Uuid {
        dispatch!(self, inner => inner.object_id())
    }

    fn stamp(&self) -> &SyncStamp {
        dispatch!(self, inner => inner.stamp())
    }

    fn stamp_mut(&mut self) -> &mut SyncStamp {
        dispatch!(self, inner => inner.stamp_mut())
    }

    fn parent(&self) -> Option<ParentRef> {
        dispatch!(self, inner => inner.parent())
    }

    fn sever_parent(&mut self) {
        dispatch!(self, inner => inner.sever_parent())
    }

    fn reassign_parent(&mut self, id: Uuid) {
        dispatch!(self, inner => inner.reassign_parent(id))
    }
}

impl SyncObject {
    /// Interval used for date-range lookups; samples and notes are instants.
    pub fn date_range(&self) -> Option<(Timestamp, Timestamp)> {
        match self {
            SyncObject::Place(_) => None,
            SyncObject::Note(note) => Some((note.date, note.date)),
            SyncObject::TimelineItem(item) => Some((item.start_date, item.end_date)),
            SyncObject::Sample(sample) => Some((sample.date, sample.date)),
            SyncObject::RangeSummary(summary) => Some((summary.start, summary.end)),
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            SyncObject::Place(place) => place.external_id.as_deref(),
            _ => None,
        }
    }

    pub fn set_last_saved(&mut self, at: Option<Timestamp>) {
        self.stamp_mut().last_saved = at;
    }

    pub fn set_backup_synced_at(&mut self, at: Option<Timestamp>) {
        self.stamp_mut().backup_synced_at = at;
    }

    pub fn set_object_id(&mut self, id: Uuid) {
        dispatch!(self, inner => inner.id = id)
    }

    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            SyncObject::Sample(sample) => Some(sample),
            _ => None,
        }
    }
}

impl From<Place> for SyncObject {
    fn from(value: Place) -> Self {
        SyncObject::Place(value)
    }
}

impl From<Note> for SyncObject {
    fn from(value: Note) -> Self {
        SyncObject::Note(value)
    }
}

impl From<TimelineItem> for SyncObject {
    fn from(value: TimelineItem) -> Self {
        SyncObject::TimelineItem(value)
    }
}

impl From<Sample> for SyncObject {
    fn from(value: Sample) -> Self {
        SyncObject::Sample(value)
    }
}

impl From<RangeSummary> for SyncObject {
    fn from(value: RangeSummary) -> Self {
        SyncObject::RangeSummary(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn note(last_saved: Option<Timestamp>, backup: Option<Timestamp>) -> Note {
        Note {
            id: Uuid::new_v4(),
            date: datetime!(2024-01-10 08:00 UTC),
            body: "coffee".into(),
            stamp: SyncStamp {
                last_saved,
                backup_synced_at: backup,
            },
        }
    }

    #[test]
    fn never_synced_objects_need_backup() {
        assert!(needs_backup(&note(None, None)));
        assert!(needs_backup(&note(Some(datetime!(2024-01-10 09:00 UTC)), None)));
    }

    #[test]
    fn backup_older_than_save_needs_backup() {
        let stale = note(
            Some(datetime!(2024-01-10 09:00 UTC)),
            Some(datetime!(2024-01-10 08:59 UTC)),
        );
        assert!(needs_backup(&stale));

        let fresh = note(
            Some(datetime!(2024-01-10 09:00 UTC)),
            Some(datetime!(2024-01-10 09:00 UTC)),
        );
        assert!(!needs_backup(&fresh));
    }

    #[test]
    fn only_visits_reference_places() {
        let place_id = Uuid::new_v4();
        let mut item = TimelineItem {
            id: Uuid::new_v4(),
            item_type: ItemType::Path,
            start_date: datetime!(2024-01-10 08:00 UTC),
            end_date: datetime!(2024-01-10 09:00 UTC),
            place_id: Some(place_id),
            activity_type: Some("walking".into()),
            stamp: SyncStamp::default(),
        };
        assert_eq!(item.parent(), None);

        item.item_type = ItemType::Visit;
        assert_eq!(
            item.parent(),
            Some(ParentRef {
                kind: ObjectKind::Place,
                id: place_id
            })
        );

        item.sever_parent();
        assert_eq!(item.parent(), None);
    }

    #[test]
    fn kinds_round_trip_through_dir_names() {
        for kind in ObjectKind::ALL {
            assert_eq!(ObjectKind::from_dir_name(kind.dir_name()), Some(kind));
            assert_eq!(ObjectKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ObjectKind::from_dir_name("Backups"), None);
    }
}
