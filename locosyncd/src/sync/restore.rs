use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use locosync_core::FileRef;
use tracing::{info, warn};

use super::engine::SyncEngine;
use super::error::SyncError;
use super::tasks::ImportOptions;
use crate::drive::{CloudDrive, DriveEntry, DriveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStatus {
    /// Placeholders were asked for; call again once they are downloaded.
    Downloading { pending: usize },
    Queued { files: usize },
}

/// The directory under the source holding the most recognizable backup
/// files. Ties go to the shallower directory.
pub fn infer_restore_root(entries: &[DriveEntry]) -> Option<PathBuf> {
    let mut counts: HashMap<PathBuf, usize> = HashMap::new();
    for entry in entries {
        for root in entry.path.ancestors().skip(1) {
            let Ok(rest) = entry.path.strip_prefix(root) else {
                continue;
            };
            if FileRef::parse_path(rest).is_some() {
                *counts.entry(root.to_path_buf()).or_default() += 1;
            }
        }
    }
    counts
        .into_iter()
        .max_by(|(left_root, left), (right_root, right)| {
            left.cmp(right).then_with(|| {
                right_root
                    .components()
                    .count()
                    .cmp(&left_root.components().count())
            })
        })
        .map(|(root, _)| root)
}

/// Backup files under `root`, with whether only the placeholder exists.
fn files_under(root: &Path, entries: &[DriveEntry]) -> BTreeMap<FileRef, bool> {
    let mut files = BTreeMap::new();
    for entry in entries {
        let Ok(rest) = entry.path.strip_prefix(root) else {
            continue;
        };
        let Some(parsed) = FileRef::parse_path(rest) else {
            continue;
        };
        let placeholder_only = files.get(&parsed.file).copied().unwrap_or(true);
        files.insert(parsed.file, placeholder_only && parsed.placeholder);
    }
    files
}

impl SyncEngine {
    /// Pulls a foreign backup folder into the import directory and queues
    /// it. Source files are removed once copied.
    pub async fn restore_from(&self, source: &dyn CloudDrive) -> Result<RestoreStatus, SyncError> {
        let entries = source.list(Path::new("")).await?;
        let Some(root) = infer_restore_root(&entries) else {
            return Err(SyncError::NothingToRestore(
                source.root().display().to_string(),
            ));
        };
        let files = files_under(&root, &entries);

        let mut pending = 0;
        for (file, placeholder_only) in &files {
            if *placeholder_only {
                source.request_download(&root.join(file.relative_path())).await?;
                pending += 1;
            }
        }
        if pending > 0 {
            info!(root = %root.display(), pending, "restore waiting for downloads");
            return Ok(RestoreStatus::Downloading { pending });
        }

        for file in files.keys() {
            let source_path = root.join(file.relative_path());
            let bytes = source.read(&source_path).await?;
            let target = file.relative_path();
            match self.import_drive.create(&target, &bytes).await {
                Ok(()) => {}
                Err(DriveError::AlreadyExists(_)) => self.import_drive.replace(&target, &bytes).await?,
                Err(err) => return Err(err.into()),
            }
            if let Err(err) = source.remove(&source_path).await {
                warn!(%file, error = %err, "could not remove restored source file");
            }
            self.enqueue_import(file, ImportOptions::restore());
        }
        info!(root = %root.display(), files = files.len(), "restore queued");
        Ok(RestoreStatus::Queued { files: files.len() })
    }
}
