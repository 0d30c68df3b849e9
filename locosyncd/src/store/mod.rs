use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use locosync_core::{ObjectKind, SyncObject, Timestamp};
use thiserror::Error;
use uuid::Uuid;

mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object body: {0}")]
    Body(#[from] serde_json::Error),
    #[error("invalid object kind: {0}")]
    InvalidKind(String),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("stored row {id} does not match its body")]
    Corrupt { id: String },
}

/// Filters understood by the local store. All set filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub needs_backup: bool,
    pub with_visits: bool,
    pub parent_id: Option<Uuid>,
    pub external_id: Option<String>,
    pub starts_within: Option<(Timestamp, Timestamp)>,
    pub since: Option<Timestamp>,
    pub interval: Option<(Timestamp, Timestamp)>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl StoreQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_backup(mut self) -> Self {
        self.needs_backup = true;
        self
    }

    pub fn with_visits(mut self) -> Self {
        self.with_visits = true;
        self
    }

    pub fn parent(mut self, id: Uuid) -> Self {
        self.parent_id = Some(id);
        self
    }

    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// Objects whose start falls in `[from, to)`.
    pub fn starts_within(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.starts_within = Some((from, to));
        self
    }

    pub fn since(mut self, from: Timestamp) -> Self {
        self.since = Some(from);
        self
    }

    pub fn interval(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.interval = Some((start, end));
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Keeps the shared store connection open while held.
#[derive(Debug)]
pub struct StoreLease {
    holders: Arc<AtomicUsize>,
}

impl StoreLease {
    pub fn new(holders: Arc<AtomicUsize>) -> Self {
        holders.fetch_add(1, Ordering::SeqCst);
        Self { holders }
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn query(
        &self,
        kind: ObjectKind,
        query: &StoreQuery,
    ) -> Result<Vec<SyncObject>, StoreError>;

    async fn count(&self, kind: ObjectKind, query: &StoreQuery) -> Result<usize, StoreError>;

    async fn get(&self, kind: ObjectKind, id: Uuid) -> Result<Option<SyncObject>, StoreError>;

    /// Inserts or replaces. An object without `last_saved` is stamped with now;
    /// a carried `last_saved` is kept as is.
    async fn commit(&self, object: SyncObject) -> Result<SyncObject, StoreError>;

    /// Same as [`LocalStore::commit`] for many objects in one transaction.
    async fn commit_all(&self, objects: Vec<SyncObject>) -> Result<Vec<SyncObject>, StoreError>;

    /// Stamps `backup_synced_at` on rows whose `last_saved` is still the one
    /// that was serialized. Returns the number of stamped rows.
    async fn mark_backed_up(
        &self,
        kind: ObjectKind,
        saved: &[(Uuid, Option<Timestamp>)],
        at: Timestamp,
    ) -> Result<usize, StoreError>;

    fn invalidate(&self, kind: ObjectKind, id: Uuid);

    fn acquire(&self) -> StoreLease;

    /// Closes the connection when no lease is held.
    async fn close_if_idle(&self) -> bool;
}
