use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use locosync_core::{ObjectKind, Syncable, SyncObject, Timestamp, decode_object};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, QueryBuilder, Row, Sqlite, SqlitePool, migrate::Migrator};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{LocalStore, StoreError, StoreLease, StoreQuery};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const CACHE_LIMIT: usize = 10_000;
const SELECT_COLUMNS: &str = "SELECT kind, id, body, last_saved, backup_synced_at FROM objects";

type CacheKey = (ObjectKind, Uuid);

pub struct SqliteStore {
    pool: RwLock<SqlitePool>,
    // None for stores that cannot be reconnected without losing data.
    reopen_with: Option<SqliteConnectOptions>,
    reopening: tokio::sync::Mutex<()>,
    cache: Mutex<HashMap<CacheKey, SyncObject>>,
    holders: Arc<AtomicUsize>,
}

impl SqliteStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool: RwLock::new(pool),
            reopen_with: None,
            reopening: tokio::sync::Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
            holders: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options.clone()).await?;
        let mut store = Self::from_pool(pool);
        store.reopen_with = Some(options);
        store.init().await?;
        Ok(store)
    }

    /// Single connection so every caller sees the same in-memory database.
    /// Never closed by [`LocalStore::close_if_idle`].
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool().await?).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.current().is_closed()
    }

    fn current(&self) -> SqlitePool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The open pool, reconnecting after an idle close.
    async fn pool(&self) -> Result<SqlitePool, StoreError> {
        let pool = self.current();
        if !pool.is_closed() {
            return Ok(pool);
        }
        let Some(options) = &self.reopen_with else {
            return Ok(pool);
        };
        let _reopening = self.reopening.lock().await;
        let pool = self.current();
        if !pool.is_closed() {
            return Ok(pool);
        }
        let pool = SqlitePool::connect_with(options.clone()).await?;
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = pool.clone();
        debug!("reopened local store");
        Ok(pool)
    }

    fn cached(&self, key: &CacheKey) -> Option<SyncObject> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn remember(&self, object: &SyncObject) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= CACHE_LIMIT {
            cache.clear();
        }
        cache.insert((object.kind(), object.object_id()), object.clone());
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn query(
        &self,
        kind: ObjectKind,
        query: &StoreQuery,
    ) -> Result<Vec<SyncObject>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut builder, kind, query);
        builder.push(if query.newest_first {
            " ORDER BY start_at DESC, id ASC"
        } else {
            " ORDER BY start_at ASC, id ASC"
        });
        if let Some(limit) = query.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        let rows = builder.build().fetch_all(&self.pool().await?).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn count(&self, kind: ObjectKind, query: &StoreQuery) -> Result<usize, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM objects");
        push_filters(&mut builder, kind, query);
        let row = builder.build().fetch_one(&self.pool().await?).await?;
        let total: i64 = row.try_get("total")?;
        Ok(usize::try_from(total).unwrap_or(0))
    }

    async fn get(&self, kind: ObjectKind, id: Uuid) -> Result<Option<SyncObject>, StoreError> {
        if let Some(object) = self.cached(&(kind, id)) {
            return Ok(Some(object));
        }
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE kind = ?1 AND id = ?2"))
            .bind(kind.as_str())
            .bind(id.to_string())
            .fetch_optional(&self.pool().await?)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let object = decode_row(&row)?;
        self.remember(&object);
        Ok(Some(object))
    }

    async fn commit(&self, object: SyncObject) -> Result<SyncObject, StoreError> {
        let object = stamped(object);
        upsert(&self.pool().await?, &object).await?;
        self.remember(&object);
        Ok(object)
    }

    async fn commit_all(&self, objects: Vec<SyncObject>) -> Result<Vec<SyncObject>, StoreError> {
        let objects: Vec<SyncObject> = objects.into_iter().map(stamped).collect();
        let mut tx = self.pool().await?.begin().await?;
        for object in &objects {
            upsert(&mut *tx, object).await?;
        }
        tx.commit().await?;
        for object in &objects {
            self.invalidate(object.kind(), object.object_id());
        }
        Ok(objects)
    }

    async fn mark_backed_up(
        &self,
        kind: ObjectKind,
        saved: &[(Uuid, Option<Timestamp>)],
        at: Timestamp,
    ) -> Result<usize, StoreError> {
        let mut stamped = 0usize;
        let mut tx = self.pool().await?.begin().await?;
        for (id, last_saved) in saved {
            let result = sqlx::query(
                "UPDATE objects SET backup_synced_at = ?1 WHERE kind = ?2 AND id = ?3 AND last_saved IS ?4",
            )
            .bind(to_nanos(at))
            .bind(kind.as_str())
            .bind(id.to_string())
            .bind(last_saved.map(to_nanos))
            .execute(&mut *tx)
            .await?;
            stamped += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        for (id, _) in saved {
            self.invalidate(kind, *id);
        }
        Ok(stamped)
    }

    fn invalidate(&self, kind: ObjectKind, id: Uuid) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, id));
    }

    fn acquire(&self) -> StoreLease {
        StoreLease::new(Arc::clone(&self.holders))
    }

    async fn close_if_idle(&self) -> bool {
        if self.reopen_with.is_none() || self.holders.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let pool = self.current();
        if pool.is_closed() {
            return false;
        }
        debug!("closing idle local store");
        pool.close().await;
        true
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, kind: ObjectKind, query: &StoreQuery) {
    builder.push(" WHERE kind = ").push_bind(kind.as_str());
    if query.needs_backup {
        builder.push(" AND (backup_synced_at IS NULL OR backup_synced_at < last_saved)");
    }
    if query.with_visits {
        builder.push(
            " AND EXISTS (SELECT 1 FROM objects v WHERE v.kind = 'timeline_item' AND v.parent_id = objects.id)",
        );
    }
    if let Some(parent) = query.parent_id {
        builder.push(" AND parent_id = ").push_bind(parent.to_string());
    }
    if let Some(external) = &query.external_id {
        builder.push(" AND external_id = ").push_bind(external.clone());
    }
    if let Some((from, to)) = query.starts_within {
        builder
            .push(" AND start_at >= ")
            .push_bind(to_nanos(from))
            .push(" AND start_at < ")
            .push_bind(to_nanos(to));
    }
    if let Some(from) = query.since {
        builder.push(" AND start_at >= ").push_bind(to_nanos(from));
    }
    if let Some((start, end)) = query.interval {
        builder
            .push(" AND start_at = ")
            .push_bind(to_nanos(start))
            .push(" AND end_at = ")
            .push_bind(to_nanos(end));
    }
}

async fn upsert<'e, E>(executor: E, object: &SyncObject) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let range = object.date_range();
    sqlx::query(
        "
            INSERT INTO objects (
                kind,
                id,
                parent_id,
                external_id,
                start_at,
                end_at,
                last_saved,
                backup_synced_at,
                body
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(kind, id) DO UPDATE SET
                parent_id = excluded.parent_id,
                external_id = excluded.external_id,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                last_saved = excluded.last_saved,
                backup_synced_at = excluded.backup_synced_at,
                body = excluded.body;
            ",
    )
    .bind(object.kind().as_str())
    .bind(object.object_id().to_string())
    .bind(object.parent().map(|parent| parent.id.to_string()))
    .bind(object.external_id().map(str::to_string))
    .bind(range.map(|(start, _)| to_nanos(start)))
    .bind(range.map(|(_, end)| to_nanos(end)))
    .bind(object.last_saved().map(to_nanos))
    .bind(object.backup_synced_at().map(to_nanos))
    .bind(encode_body(object)?)
    .execute(executor)
    .await?;
    Ok(())
}

fn stamped(mut object: SyncObject) -> SyncObject {
    if object.last_saved().is_none() {
        object.set_last_saved(Some(OffsetDateTime::now_utc()));
    }
    object
}

fn decode_row(row: &SqliteRow) -> Result<SyncObject, StoreError> {
    let id: Option<String> = row.try_get("id")?;
    // The primary key guarantees an id; a row without one means the schema is broken.
    let Some(id) = id else {
        panic!("objects row without identity column");
    };
    let kind: String = row.try_get("kind")?;
    let kind = ObjectKind::parse(&kind).ok_or(StoreError::InvalidKind(kind))?;
    let body: String = row.try_get("body")?;
    let mut object = decode_body(kind, &body)?;
    if object.object_id().to_string() != id {
        return Err(StoreError::Corrupt { id });
    }
    let last_saved: Option<i64> = row.try_get("last_saved")?;
    let backup_synced_at: Option<i64> = row.try_get("backup_synced_at")?;
    object.set_last_saved(last_saved.map(from_nanos).transpose()?);
    object.set_backup_synced_at(backup_synced_at.map(from_nanos).transpose()?);
    Ok(object)
}

fn encode_body(object: &SyncObject) -> Result<String, StoreError> {
    Ok(match object {
        SyncObject::Place(place) => serde_json::to_string(place)?,
        SyncObject::Note(note) => serde_json::to_string(note)?,
        SyncObject::TimelineItem(item) => serde_json::to_string(item)?,
        SyncObject::Sample(sample) => serde_json::to_string(sample)?,
        SyncObject::RangeSummary(summary) => serde_json::to_string(summary)?,
    })
}

fn decode_body(kind: ObjectKind, body: &str) -> Result<SyncObject, StoreError> {
    if kind == ObjectKind::Sample {
        return Ok(SyncObject::Sample(serde_json::from_str(body)?));
    }
    decode_object(kind, body.as_bytes()).map_err(|err| match err {
        locosync_core::CodecError::Json(err) => StoreError::Body(err),
        other => StoreError::InvalidKind(other.to_string()),
    })
}

fn to_nanos(at: Timestamp) -> i64 {
    i64::try_from(at.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn from_nanos(value: i64) -> Result<Timestamp, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value))
        .map_err(|_| StoreError::InvalidTimestamp(value))
}

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;
