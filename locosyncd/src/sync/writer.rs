use std::path::Path;

use locosync_core::{
    FileRef, IsoWeek, ObjectKind, SampleBatch, SyncObject, Syncable, encode_object,
    encode_sample_batch,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::engine::SyncEngine;
use super::error::SyncError;
use crate::drive::{DriveError, EntryStatus};
use crate::store::StoreQuery;

impl SyncEngine {
    /// Writes one object to its backup file. Returns whether the file was
    /// written and the object stamped as backed up.
    pub async fn backup_object(&self, object: &SyncObject) -> Result<bool, SyncError> {
        let bytes = encode_object(object)?;
        let file = FileRef::for_object(object.kind(), object.object_id());
        if !self.write_backup_file(&file.relative_path(), &bytes).await? {
            return Ok(false);
        }
        let stamped = self
            .store
            .mark_backed_up(
                object.kind(),
                &[(object.object_id(), object.last_saved())],
                OffsetDateTime::now_utc(),
            )
            .await?;
        if stamped == 0 {
            debug!(%file, "object changed while being written, leaving it pending");
        }
        Ok(true)
    }

    /// Rewrites the whole batch file of one ISO week.
    pub async fn backup_week(&self, week: IsoWeek) -> Result<bool, SyncError> {
        let query = StoreQuery::new().starts_within(week.start(), week.end());
        let objects = self.store.query(ObjectKind::Sample, &query).await?;
        let saved: Vec<_> = objects
            .iter()
            .map(|object| (object.object_id(), object.last_saved()))
            .collect();
        let samples = objects
            .into_iter()
            .filter_map(|object| match object {
                SyncObject::Sample(sample) => Some(sample),
                _ => None,
            })
            .collect();
        let batch = SampleBatch::new(week, samples);
        let bytes = encode_sample_batch(&batch)?;
        let file = FileRef::for_week(week);
        if !self.write_backup_file(&file.relative_path(), &bytes).await? {
            return Ok(false);
        }
        let stamped = self
            .store
            .mark_backed_up(ObjectKind::Sample, &saved, OffsetDateTime::now_utc())
            .await?;
        debug!(%week, samples = saved.len(), stamped, "sample week written");
        Ok(true)
    }

    async fn write_backup_file(&self, path: &Path, bytes: &[u8]) -> Result<bool, SyncError> {
        let drive = &self.backup_drive;
        match drive.status(path).await? {
            EntryStatus::Placeholder => {
                info!(path = %path.display(), "backup file not downloaded, retrying later");
                drive.request_download(path).await?;
                Ok(false)
            }
            EntryStatus::Present => {
                drive.replace(path, bytes).await?;
                Ok(true)
            }
            EntryStatus::Missing => match drive.create(path, bytes).await {
                Ok(()) => Ok(true),
                Err(DriveError::AlreadyExists(_)) => {
                    debug!(path = %path.display(), "backup file appeared concurrently, retrying later");
                    Ok(false)
                }
                Err(err) => Err(err.into()),
            },
        }
    }
}
