//! Outbound change detection. Read-only against the store.

use std::collections::{BTreeSet, HashSet};

use locosync_core::{IsoWeek, ObjectKind, SyncObject, Syncable};
use uuid::Uuid;

use crate::store::{LocalStore, StoreError, StoreQuery};

const OBJECT_BATCH: usize = 50;
const SAMPLE_BATCH: usize = 1_000;
const WEEK_BATCH: usize = 4;
const WEEK_PAGES: usize = 8;

fn pending_query(kind: ObjectKind) -> StoreQuery {
    let query = StoreQuery::new().needs_backup();
    match kind {
        ObjectKind::Place => query.with_visits(),
        _ => query,
    }
}

/// Next objects of `kind` awaiting backup, skipping ids already tried in
/// this run.
pub async fn pending_objects(
    store: &dyn LocalStore,
    kind: ObjectKind,
    skip: &HashSet<Uuid>,
) -> Result<Vec<SyncObject>, StoreError> {
    let query = pending_query(kind).limit(OBJECT_BATCH + skip.len());
    Ok(store
        .query(kind, &query)
        .await?
        .into_iter()
        .filter(|object| !skip.contains(&object.object_id()))
        .take(OBJECT_BATCH)
        .collect())
}

/// ISO weeks holding samples that await backup, oldest first.
pub async fn pending_weeks(
    store: &dyn LocalStore,
    skip: &HashSet<IsoWeek>,
) -> Result<Vec<IsoWeek>, StoreError> {
    let mut since = None;
    for _ in 0..WEEK_PAGES {
        let mut query = pending_query(ObjectKind::Sample).limit(SAMPLE_BATCH);
        if let Some(from) = since {
            query = query.since(from);
        }
        let samples = store.query(ObjectKind::Sample, &query).await?;
        let weeks: BTreeSet<IsoWeek> = samples
            .iter()
            .filter_map(SyncObject::as_sample)
            .map(|sample| IsoWeek::containing(sample.date))
            .collect();
        let fresh: Vec<IsoWeek> = weeks
            .iter()
            .filter(|week| !skip.contains(week))
            .take(WEEK_BATCH)
            .copied()
            .collect();
        if !fresh.is_empty() || samples.len() < SAMPLE_BATCH {
            return Ok(fresh);
        }
        since = weeks.last().map(IsoWeek::end);
    }
    Ok(Vec::new())
}

pub async fn pending_count_of(store: &dyn LocalStore, kind: ObjectKind) -> Result<usize, StoreError> {
    store.count(kind, &pending_query(kind)).await
}

/// Objects still awaiting backup across all kinds.
pub async fn pending_count(store: &dyn LocalStore) -> Result<usize, StoreError> {
    let mut total = 0;
    for kind in ObjectKind::ALL {
        total += pending_count_of(store, kind).await?;
    }
    Ok(total)
}
