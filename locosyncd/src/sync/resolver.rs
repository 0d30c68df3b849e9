use std::collections::{BTreeSet, HashMap};

use locosync_core::{FileRef, ObjectKind, ParentRef, SyncObject, Syncable, decode_object};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::engine::SyncEngine;
use super::error::{ImportError, SyncError};
use super::tasks::{ImportOptions, ImportState, TaskOrigin};
use crate::drive::EntryStatus;
use crate::store::StoreQuery;

/// Parent imports nest at most this deep below the file being imported.
pub const MAX_PARENT_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready,
    Deferred(FileRef),
    Missing(ParentRef),
    Error(ImportError),
}

/// Per-import state threaded through nested parent imports.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub cancel: CancellationToken,
    pub depth: usize,
    /// Sever references to missing parents instead of failing. Covers this
    /// import and the parents it pulls in, nothing later.
    pub ignore_missing: bool,
    chain: BTreeSet<FileRef>,
}

impl ImportContext {
    pub fn root(file: &FileRef, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            depth: 0,
            ignore_missing: false,
            chain: BTreeSet::from([file.clone()]),
        }
    }

    pub fn ignoring_missing(&self, ignore_missing: bool) -> Self {
        Self {
            ignore_missing: self.ignore_missing || ignore_missing,
            ..self.clone()
        }
    }

    pub fn nested(&self, file: &FileRef) -> Self {
        let mut chain = self.chain.clone();
        chain.insert(file.clone());
        Self {
            cancel: self.cancel.clone(),
            depth: self.depth + 1,
            ignore_missing: self.ignore_missing,
            chain,
        }
    }

    fn can_descend_into(&self, file: &FileRef) -> bool {
        self.depth < MAX_PARENT_DEPTH && !self.chain.contains(file)
    }
}

#[derive(Debug, Clone)]
enum CachedParent {
    Ready,
    Reassign(Uuid),
    Sever,
    Deferred(FileRef),
    Missing,
    Error(ImportError),
}

/// Parent lookups shared by all units of one file.
#[derive(Debug, Default)]
pub struct ParentCache {
    parents: HashMap<ParentRef, CachedParent>,
}

impl SyncEngine {
    /// Makes sure the parent `object` points at exists locally, fixing the
    /// reference up when it was merged or is to be dropped.
    pub(super) async fn resolve(
        &self,
        object: &mut SyncObject,
        cache: &mut ParentCache,
        ctx: &ImportContext,
        options: ImportOptions,
    ) -> Result<Resolution, SyncError> {
        let Some(parent) = object.parent() else {
            return Ok(Resolution::Ready);
        };
        let cached = match cache.parents.get(&parent) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = self.resolve_parent(parent, ctx, options).await?;
                cache.parents.insert(parent, resolved.clone());
                resolved
            }
        };
        Ok(match cached {
            CachedParent::Ready => Resolution::Ready,
            CachedParent::Reassign(id) => {
                object.reassign_parent(id);
                Resolution::Ready
            }
            CachedParent::Sever => {
                object.sever_parent();
                Resolution::Ready
            }
            CachedParent::Deferred(file) => Resolution::Deferred(file),
            CachedParent::Missing => Resolution::Missing(parent),
            CachedParent::Error(err) => Resolution::Error(err),
        })
    }

    async fn resolve_parent(
        &self,
        parent: ParentRef,
        ctx: &ImportContext,
        options: ImportOptions,
    ) -> Result<CachedParent, SyncError> {
        match self.store.get(parent.kind, parent.id).await {
            Ok(Some(_)) => return Ok(CachedParent::Ready),
            Ok(None) => {}
            Err(err) => return Ok(CachedParent::Error(err.into())),
        }

        let file = FileRef::for_object(parent.kind, parent.id);
        if self
            .tasks
            .get(&file)
            .is_some_and(|task| task.state == ImportState::Downloading)
        {
            return Ok(CachedParent::Deferred(file));
        }

        if !self.tasks.is_missing(&parent) {
            let located = match self.locate(&file, options.origin).await {
                Ok(located) => located,
                Err(err) => return Ok(CachedParent::Error(ImportError::from(&err))),
            };
            match located {
                Some((origin, EntryStatus::Placeholder)) => {
                    return self.start_parent_download(&file, origin).await;
                }
                Some((origin, EntryStatus::Present)) => {
                    if let Some(resolved) = self
                        .import_parent(parent, &file, origin, ctx)
                        .await?
                    {
                        return Ok(resolved);
                    }
                }
                Some((_, EntryStatus::Missing)) | None => {}
            }
        }

        if ctx.ignore_missing {
            debug!(%parent, "severing reference to missing parent");
            return Ok(CachedParent::Sever);
        }
        self.tasks.mark_missing(parent);
        Ok(CachedParent::Missing)
    }

    /// Finds the drive holding `file`. Restored children look in the
    /// restore copy first, then fall back to the backup drive.
    async fn locate(
        &self,
        file: &FileRef,
        origin: TaskOrigin,
    ) -> Result<Option<(TaskOrigin, EntryStatus)>, SyncError> {
        let mut origins = vec![origin];
        if origin != TaskOrigin::Backup {
            origins.push(TaskOrigin::Backup);
        }
        for origin in origins {
            let status = self.drive_for(origin).status(&file.relative_path()).await?;
            if status != EntryStatus::Missing {
                return Ok(Some((origin, status)));
            }
        }
        Ok(None)
    }

    async fn start_parent_download(
        &self,
        file: &FileRef,
        origin: TaskOrigin,
    ) -> Result<CachedParent, SyncError> {
        let drive = self.drive_for(origin);
        if let Err(err) = drive.request_download(&file.relative_path()).await {
            return Ok(CachedParent::Error(err.into()));
        }
        self.tasks.ensure(file, parent_options(origin));
        if let Err(err) = self.tasks.transition(file, ImportState::Downloading) {
            debug!(%file, error = %err, "parent task busy, deferring");
        }
        Ok(CachedParent::Deferred(file.clone()))
    }

    /// `None` means the parent file turned out to be unusable and the
    /// reference counts as missing.
    async fn import_parent(
        &self,
        parent: ParentRef,
        file: &FileRef,
        origin: TaskOrigin,
        ctx: &ImportContext,
    ) -> Result<Option<CachedParent>, SyncError> {
        if parent.kind == ObjectKind::Place
            && let Some(existing) = self.merged_place(file, origin).await
        {
            debug!(%parent, merged_into = %existing, "parent place merged by external id");
            return Ok(Some(CachedParent::Reassign(existing)));
        }

        if !ctx.can_descend_into(file) {
            return Ok(Some(CachedParent::Error(ImportError::DependencyDepth {
                parent,
            })));
        }

        self.tasks.ensure(file, parent_options(origin));
        let state = match self.import_with(file.clone(), ctx.nested(file)).await {
            Ok(state) => state,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(err) => return Ok(Some(CachedParent::Error(ImportError::from(&err)))),
        };

        match self.store.get(parent.kind, parent.id).await {
            Ok(Some(_)) => return Ok(Some(CachedParent::Ready)),
            Ok(None) => {}
            Err(err) => return Ok(Some(CachedParent::Error(err.into()))),
        }
        Ok(match state {
            ImportState::Errored | ImportState::Finished => None,
            _ => Some(CachedParent::Deferred(file.clone())),
        })
    }

    /// Id of a local place carrying the same external id as the place
    /// stored in `file`, when that place has a different id.
    async fn merged_place(&self, file: &FileRef, origin: TaskOrigin) -> Option<Uuid> {
        let bytes = self
            .drive_for(origin)
            .read(&file.relative_path())
            .await
            .ok()?;
        let incoming = decode_object(ObjectKind::Place, &bytes).ok()?;
        let external = incoming.external_id()?.to_string();
        let query = StoreQuery::new().external_id(external).limit(1);
        let existing = self
            .store
            .query(ObjectKind::Place, &query)
            .await
            .ok()?
            .into_iter()
            .next()?;
        (existing.object_id() != incoming.object_id()).then(|| existing.object_id())
    }
}

fn parent_options(origin: TaskOrigin) -> ImportOptions {
    match origin {
        TaskOrigin::Backup => ImportOptions::default(),
        TaskOrigin::Restore => ImportOptions::restore(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn context_bounds_depth_and_cycles() {
        let root = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        let place = FileRef::for_object(ObjectKind::Place, Uuid::new_v4());
        let item = FileRef::for_object(ObjectKind::TimelineItem, Uuid::new_v4());
        let ctx = ImportContext::root(&root, CancellationToken::new());

        assert!(ctx.can_descend_into(&item));
        assert!(!ctx.can_descend_into(&root));

        let nested = ctx.nested(&item);
        assert_eq!(nested.depth, 1);
        assert!(nested.can_descend_into(&place));
        assert!(!nested.can_descend_into(&item));

        let deepest = nested.nested(&place);
        assert!(!deepest.can_descend_into(&FileRef::for_object(ObjectKind::Place, Uuid::new_v4())));
    }

    #[test]
    fn ignore_missing_reaches_nested_parents_only_when_asked() {
        let root = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        let item = FileRef::for_object(ObjectKind::TimelineItem, Uuid::new_v4());
        let ctx = ImportContext::root(&root, CancellationToken::new());
        assert!(!ctx.nested(&item).ignore_missing);

        let ignoring = ctx.ignoring_missing(true);
        assert!(ignoring.nested(&item).ignore_missing);
        assert!(ignoring.ignoring_missing(false).ignore_missing);
        assert!(!ctx.ignore_missing);
    }
}
