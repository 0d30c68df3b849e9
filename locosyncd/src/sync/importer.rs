use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use locosync_core::{
    FileRef, ObjectKind, SyncObject, Syncable, decode_object, decode_sample_batch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conflict::{MergeDecision, decide};
use super::engine::SyncEngine;
use super::error::{ImportError, SyncError};
use super::resolver::{ImportContext, ParentCache, Resolution};
use super::tasks::{ImportOptions, ImportState};
use crate::drive::{CloudDrive, DriveError, EntryStatus};
use crate::store::{StoreError, StoreQuery};

/// Unit counters for one pass over a file.
#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    existing: usize,
    deferred: usize,
    errored: usize,
    errors: Vec<ImportError>,
    dependents: BTreeSet<FileRef>,
}

impl Tally {
    fn error(&mut self, err: ImportError) {
        self.errored += 1;
        self.errors.push(err);
    }
}

/// How an incoming unit lines up with local data.
enum LocalMatch {
    Found(SyncObject),
    /// A different local place already stands for the same venue.
    Duplicate,
    None,
}

impl SyncEngine {
    /// Imports one file right away, outside of any scheduled run.
    pub async fn import_file(
        &self,
        file: &FileRef,
        options: ImportOptions,
    ) -> Result<ImportState, SyncError> {
        self.tasks.ensure(file, options);
        let cancel = CancellationToken::new();
        self.import_with(file.clone(), ImportContext::root(file, cancel))
            .await
    }

    pub(super) async fn import_queued(
        &self,
        file: &FileRef,
        cancel: &CancellationToken,
    ) -> Result<ImportState, SyncError> {
        self.import_with(file.clone(), ImportContext::root(file, cancel.clone()))
            .await
    }

    // Boxed: parent resolution imports parent files through this again.
    pub(super) fn import_with(
        &self,
        file: FileRef,
        ctx: ImportContext,
    ) -> BoxFuture<'_, Result<ImportState, SyncError>> {
        async move { self.run_import(&file, &ctx).await }.boxed()
    }

    async fn run_import(
        &self,
        file: &FileRef,
        ctx: &ImportContext,
    ) -> Result<ImportState, SyncError> {
        let task = self.tasks.ensure(file, ImportOptions::default());
        if task.state.is_active() {
            return Ok(task.state);
        }
        let options = task.options;
        let drive = Arc::clone(self.drive_for(options.origin));
        let path = file.relative_path();

        match drive.status(&path).await {
            Ok(EntryStatus::Present) => {}
            Ok(EntryStatus::Placeholder) => {
                drive.request_download(&path).await?;
                self.tasks.transition(file, ImportState::Downloading)?;
                debug!(%file, "waiting for download");
                return Ok(ImportState::Downloading);
            }
            // imported through a child and removed since it was queued
            Ok(EntryStatus::Missing) if task.state == ImportState::Finished => {
                debug!(%file, "already imported");
                return Ok(ImportState::Finished);
            }
            Ok(EntryStatus::Missing) => {
                let err = DriveError::NotFound(path.clone());
                return Ok(self.fail(file, ImportError::from(err)));
            }
            Err(err) => return Ok(self.revert(file, err)),
        }

        if task.state == ImportState::Downloading {
            self.tasks.transition(file, ImportState::Created)?;
        }
        if let Err(err) = self.tasks.transition(file, ImportState::Opening) {
            debug!(%file, error = %err, "import already running");
            return Ok(err.from);
        }
        self.tasks.update(file, |task| task.reset_counters());

        let bytes = match drive.read(&path).await {
            Ok(bytes) => bytes,
            Err(DriveError::DownloadPending(_)) => {
                drive.request_download(&path).await?;
                self.tasks.transition(file, ImportState::Downloading)?;
                return Ok(ImportState::Downloading);
            }
            Err(err) => return Ok(self.revert(file, err)),
        };
        let units = match decode_units(file, &bytes) {
            Ok(units) => units,
            Err(err) => {
                warn!(%file, error = %err, "backup file is unreadable");
                return Ok(self.fail(file, err));
            }
        };

        self.tasks.transition(file, ImportState::Importing)?;
        // A retry that ignores missing parents covers this one import.
        self.tasks.update(file, |task| {
            task.total_units = Some(units.len());
            task.options.ignore_missing = false;
        });
        let ctx = ctx.ignoring_missing(options.ignore_missing);

        let tally = match self.import_units(file, units, &ctx, options).await {
            Ok(tally) => tally,
            Err(SyncError::Cancelled) => {
                self.tasks.update(file, |task| {
                    task.reset_counters();
                    task.options.ignore_missing |= options.ignore_missing;
                });
                self.tasks.transition(file, ImportState::Created)?;
                debug!(%file, "import cancelled before commit");
                return Err(SyncError::Cancelled);
            }
            Err(err) => return Ok(self.fail(file, ImportError::from(&err))),
        };
        self.finish(file, drive.as_ref(), options, tally).await
    }

    async fn import_units(
        &self,
        file: &FileRef,
        units: Vec<SyncObject>,
        ctx: &ImportContext,
        options: ImportOptions,
    ) -> Result<Tally, SyncError> {
        let mut local_samples = match file.week() {
            Some(week) => {
                let query = StoreQuery::new().starts_within(week.start(), week.end());
                self.store
                    .query(ObjectKind::Sample, &query)
                    .await?
                    .into_iter()
                    .map(|object| (object.object_id(), object))
                    .collect()
            }
            None => HashMap::new(),
        };

        let mut tally = Tally::default();
        let mut cache = ParentCache::default();
        let mut commits = Vec::new();
        for mut unit in units {
            if ctx.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match self.resolve(&mut unit, &mut cache, ctx, options).await? {
                Resolution::Ready => {}
                Resolution::Deferred(parent_file) => {
                    tally.deferred += 1;
                    tally.dependents.insert(parent_file);
                    continue;
                }
                Resolution::Missing(parent) => {
                    tally.error(ImportError::MissingDependentFile {
                        parent,
                        child: unit.object_id(),
                    });
                    continue;
                }
                Resolution::Error(err) => {
                    tally.error(err);
                    continue;
                }
            }

            let local = match self.local_match(&mut unit, &mut local_samples).await {
                Ok(LocalMatch::Duplicate) => {
                    tally.existing += 1;
                    continue;
                }
                Ok(LocalMatch::Found(local)) => Some(local),
                Ok(LocalMatch::None) => None,
                Err(err) => {
                    tally.error(err.into());
                    continue;
                }
            };
            match decide(local.as_ref(), &unit) {
                MergeDecision::Insert => {
                    unit.set_last_saved(None);
                    unit.set_backup_synced_at(None);
                    commits.push(unit);
                    tally.succeeded += 1;
                }
                MergeDecision::Existing => tally.existing += 1,
                MergeDecision::Replace => {
                    self.store.invalidate(unit.kind(), unit.object_id());
                    unit.set_backup_synced_at(local.and_then(|local| local.backup_synced_at()));
                    commits.push(unit);
                    tally.succeeded += 1;
                }
                MergeDecision::Reject => {
                    tally.error(ImportError::StaleWriteRejected {
                        id: unit.object_id(),
                    });
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !commits.is_empty()
            && let Err(err) = self.store.commit_all(commits).await
        {
            warn!(%file, error = %err, "committing imported objects failed");
            tally.errored += tally.succeeded;
            tally.succeeded = 0;
            tally.errors.push(err.into());
        }
        Ok(tally)
    }

    async fn local_match(
        &self,
        unit: &mut SyncObject,
        local_samples: &mut HashMap<Uuid, SyncObject>,
    ) -> Result<LocalMatch, StoreError> {
        let kind = unit.kind();
        let id = unit.object_id();
        // Samples of the file's week were fetched up front; one that moved
        // weeks locally is still looked up by id.
        let found = match kind {
            ObjectKind::Sample => match local_samples.remove(&id) {
                Some(found) => Some(found),
                None => self.store.get(kind, id).await?,
            },
            _ => self.store.get(kind, id).await?,
        };
        if let Some(found) = found {
            return Ok(LocalMatch::Found(found));
        }

        match &*unit {
            SyncObject::RangeSummary(summary) => {
                let query = StoreQuery::new()
                    .interval(summary.start, summary.end)
                    .limit(1);
                let same_range = self
                    .store
                    .query(ObjectKind::RangeSummary, &query)
                    .await?
                    .into_iter()
                    .next();
                Ok(match same_range {
                    Some(local) => {
                        unit.set_object_id(local.object_id());
                        LocalMatch::Found(local)
                    }
                    None => LocalMatch::None,
                })
            }
            SyncObject::Place(place) => {
                let Some(external) = place.external_id.clone() else {
                    return Ok(LocalMatch::None);
                };
                let query = StoreQuery::new().external_id(external).limit(1);
                let same_venue = self.store.count(ObjectKind::Place, &query).await?;
                Ok(if same_venue > 0 {
                    LocalMatch::Duplicate
                } else {
                    LocalMatch::None
                })
            }
            _ => Ok(LocalMatch::None),
        }
    }

    async fn finish(
        &self,
        file: &FileRef,
        drive: &dyn CloudDrive,
        options: ImportOptions,
        tally: Tally,
    ) -> Result<ImportState, SyncError> {
        let state = if tally.deferred > 0 {
            ImportState::Waiting
        } else if tally.errored > 0 {
            ImportState::Errored
        } else {
            ImportState::Finished
        };
        let (succeeded, existing, deferred, errored) =
            (tally.succeeded, tally.existing, tally.deferred, tally.errored);
        self.tasks.update(file, |task| {
            task.succeeded = succeeded;
            task.existing = existing;
            task.deferred = deferred;
            task.errored = errored;
            task.errors = tally.errors;
        });
        let idle = self.tasks.settle(file, state, tally.dependents)?;
        info!(
            %file,
            state = state.as_str(),
            succeeded,
            existing,
            deferred,
            errored,
            "file imported"
        );

        if idle {
            self.enqueue_import(file, ImportOptions::default());
        }
        if state == ImportState::Finished
            && options.delete_on_finish
            && let Err(err) = drive.remove(&file.relative_path()).await
        {
            warn!(%file, error = %err, "removing imported file failed");
        }
        if matches!(state, ImportState::Finished | ImportState::Errored) {
            for released in self.tasks.release_dependents(file) {
                debug!(%released, parent = %file, "dependent released");
                self.enqueue_import(&released, ImportOptions::default());
            }
        }
        Ok(state)
    }

    fn fail(&self, file: &FileRef, err: ImportError) -> ImportState {
        self.tasks.update(file, |task| {
            task.errored += 1;
            task.errors.push(err);
        });
        if let Err(err) = self.tasks.transition(file, ImportState::Errored) {
            warn!(%file, error = %err, "could not mark import errored");
        }
        ImportState::Errored
    }

    /// I/O trouble is not the file's fault: put it back for the next tick.
    fn revert(&self, file: &FileRef, err: DriveError) -> ImportState {
        warn!(%file, error = %err, "reading backup file failed, will retry");
        self.tasks
            .update(file, |task| task.errors.push(ImportError::from(err)));
        match self.tasks.transition(file, ImportState::Created) {
            Ok(_) => ImportState::Created,
            Err(err) => err.from,
        }
    }
}

fn decode_units(file: &FileRef, bytes: &[u8]) -> Result<Vec<SyncObject>, ImportError> {
    if file.kind() == ObjectKind::Sample {
        let batch = decode_sample_batch(bytes)?;
        if Some(batch.week) != file.week() {
            return Err(ImportError::Decode(format!(
                "{file} holds samples of {}",
                batch.week
            )));
        }
        return Ok(batch.samples.into_iter().map(SyncObject::Sample).collect());
    }
    let object = decode_object(file.kind(), bytes)?;
    if Some(object.object_id()) != file.object_id() {
        return Err(ImportError::Decode(format!(
            "{file} holds object {}",
            object.object_id()
        )));
    }
    Ok(vec![object])
}

#[cfg(test)]
mod tests {
    use super::*;
    use locosync_core::{IsoWeek, Note, SampleBatch, SyncStamp, encode_object, encode_sample_batch};
    use time::macros::datetime;

    #[test]
    fn decodes_single_objects_and_checks_identity() {
        let id = Uuid::new_v4();
        let note = SyncObject::Note(Note {
            id,
            date: datetime!(2024-02-01 12:00 UTC),
            body: "lunch".into(),
            stamp: SyncStamp::default(),
        });
        let bytes = encode_object(&note).unwrap();

        let units = decode_units(&FileRef::for_object(ObjectKind::Note, id), &bytes).unwrap();
        assert_eq!(units, vec![note]);

        let other = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        assert!(matches!(
            decode_units(&other, &bytes),
            Err(ImportError::Decode(_))
        ));
        assert!(matches!(
            decode_units(&other, b"{ not json"),
            Err(ImportError::Decode(_))
        ));
    }

    #[test]
    fn sample_batch_must_match_file_week() {
        let week: IsoWeek = "2024-W05".parse().unwrap();
        let bytes = encode_sample_batch(&SampleBatch::new(week, Vec::new())).unwrap();
        assert!(decode_units(&FileRef::for_week(week), &bytes).unwrap().is_empty());
        assert!(decode_units(&FileRef::for_week(week.previous()), &bytes).is_err());
    }
}
