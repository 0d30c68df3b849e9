use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use locosync_core::{FileRef, ObjectKind, ParentRef};
use tracing::debug;

use super::engine::SyncEngine;
use super::error::SyncError;
use super::tasks::{ImportOptions, ImportState, TaskOrigin};
use crate::drive::{CloudDrive, DriveEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub file: FileRef,
    pub placeholder: bool,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub files: BTreeMap<ObjectKind, Vec<ScannedFile>>,
    pub queued: usize,
    pub downloads_completed: usize,
    pub released: usize,
    /// Leftover restore copies put back on the queue.
    pub restored: usize,
}

impl ScanReport {
    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

/// Lists one kind directory, newest first. A downloaded file shadows its
/// placeholder.
pub async fn scan_kind(
    drive: &dyn CloudDrive,
    kind: ObjectKind,
) -> Result<Vec<ScannedFile>, SyncError> {
    let entries = drive.list(Path::new(kind.dir_name())).await?;
    Ok(classify(kind, entries))
}

fn classify(kind: ObjectKind, entries: Vec<DriveEntry>) -> Vec<ScannedFile> {
    let mut by_file: BTreeMap<FileRef, ScannedFile> = BTreeMap::new();
    for entry in entries {
        let Some(parsed) = FileRef::parse_path(&entry.path) else {
            continue;
        };
        if parsed.file.kind() != kind {
            continue;
        }
        let scanned = ScannedFile {
            file: parsed.file.clone(),
            placeholder: parsed.placeholder,
            modified: entry.modified,
        };
        match by_file.get(&parsed.file) {
            Some(existing) if !existing.placeholder => {}
            _ => {
                by_file.insert(parsed.file, scanned);
            }
        }
    }

    let mut files: Vec<ScannedFile> = by_file.into_values().collect();
    match kind {
        ObjectKind::Sample => files.sort_by(|a, b| b.file.name().cmp(a.file.name())),
        _ => files.sort_by_key(|scanned| Reverse(scanned.modified)),
    }
    files
}

impl SyncEngine {
    /// Walks the backup drive and feeds the import queue. Restored copies
    /// still sitting in the import directory are queued as well, so a
    /// restart or a cancelled run never strands them.
    pub async fn scan(&self) -> Result<ScanReport, SyncError> {
        let mut report = ScanReport::default();
        for kind in ObjectKind::ALL {
            let files = scan_kind(self.backup_drive.as_ref(), kind).await?;
            for scanned in &files {
                self.observe(scanned, &mut report);
            }
            report.files.insert(kind, files);
        }
        for kind in ObjectKind::ALL {
            for scanned in scan_kind(self.import_drive.as_ref(), kind).await? {
                self.observe_restored(&scanned, &mut report);
            }
        }
        debug!(
            files = report.total(),
            queued = report.queued,
            restored = report.restored,
            "backup drive scanned"
        );
        Ok(report)
    }

    fn observe_restored(&self, scanned: &ScannedFile, report: &mut ScanReport) {
        if scanned.placeholder {
            return;
        }
        let file = &scanned.file;
        let requeue = self.tasks.get(file).is_none_or(|task| {
            matches!(
                task.state,
                ImportState::Created | ImportState::Queued | ImportState::Finished
            )
        });
        if requeue && self.enqueue_import(file, ImportOptions::restore()) {
            report.restored += 1;
        }
    }

    fn observe(&self, scanned: &ScannedFile, report: &mut ScanReport) {
        let file = &scanned.file;
        if let Some(id) = file.object_id() {
            self.tasks.clear_missing(&ParentRef {
                kind: file.kind(),
                id,
            });
        }

        let requeue = match self.tasks.get(file) {
            None => {
                self.tasks.ensure(file, ImportOptions::default());
                true
            }
            Some(task) if task.options.origin == TaskOrigin::Restore => {
                // The restore copy finished; the drive file is a new source.
                if task.state == ImportState::Finished {
                    self.tasks
                        .update(file, |task| task.options = ImportOptions::default());
                    true
                } else {
                    false
                }
            }
            Some(task) => match task.state {
                ImportState::Downloading if !scanned.placeholder => {
                    let completed = self.tasks.transition(file, ImportState::Created).is_ok();
                    if completed {
                        report.downloads_completed += 1;
                    }
                    completed
                }
                ImportState::Created | ImportState::Queued => true,
                ImportState::Finished => {
                    task.seen_modified.is_some() && task.seen_modified != scanned.modified
                }
                _ => false,
            },
        };
        self.tasks
            .update(file, |task| task.seen_modified = scanned.modified);

        if requeue && self.enqueue_import(file, ImportOptions::default()) {
            report.queued += 1;
        }
        if !scanned.placeholder {
            for released in self.tasks.release_dependents(file) {
                if self.enqueue_import(&released, ImportOptions::default()) {
                    report.released += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry(path: PathBuf, age_secs: u64) -> DriveEntry {
        DriveEntry {
            path,
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 - age_secs)),
        }
    }

    #[test]
    fn real_file_shadows_placeholder() {
        let file = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        let entries = vec![
            entry(file.placeholder_path(), 10),
            entry(file.relative_path(), 5),
        ];
        let files = classify(ObjectKind::Note, entries);
        assert_eq!(files.len(), 1);
        assert!(!files[0].placeholder);

        let entries = vec![
            entry(file.relative_path(), 5),
            entry(file.placeholder_path(), 10),
        ];
        let files = classify(ObjectKind::Note, entries);
        assert!(!files[0].placeholder);
    }

    #[test]
    fn skips_misplaced_and_oddly_spelled_files() {
        let id = Uuid::new_v4();
        let file = FileRef::for_object(ObjectKind::TimelineItem, id);
        let files = classify(
            ObjectKind::TimelineItem,
            vec![
                entry(PathBuf::from(format!("TimelineItem/{id}.json")), 3),
                entry(
                    PathBuf::from(format!("TimelineItem/zz/{}.json", id.simple())),
                    2,
                ),
                entry(file.relative_path(), 1),
            ],
        );
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file, file);
    }

    #[test]
    fn orders_newest_first() {
        let older = FileRef::for_object(ObjectKind::Place, Uuid::new_v4());
        let newer = FileRef::for_object(ObjectKind::Place, Uuid::new_v4());
        let files = classify(
            ObjectKind::Place,
            vec![
                entry(older.relative_path(), 100),
                entry(newer.relative_path(), 1),
                entry(PathBuf::from("Place/notes.txt"), 0),
            ],
        );
        let names: Vec<&FileRef> = files.iter().map(|scanned| &scanned.file).collect();
        assert_eq!(names, vec![&newer, &older]);

        let weeks = classify(
            ObjectKind::Sample,
            vec![
                entry(PathBuf::from("LocomotionSample/2023/2023-W52.json.gz"), 0),
                entry(PathBuf::from("LocomotionSample/2024/2024-W02.json.gz"), 50),
            ],
        );
        assert_eq!(weeks[0].file.name(), "2024-W02.json.gz");
    }
}
