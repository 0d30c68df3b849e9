use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use locosync_core::{FileRef, ParentRef};
use thiserror::Error;

use super::error::ImportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportState {
    Created,
    Queued,
    Downloading,
    Opening,
    Importing,
    Waiting,
    Errored,
    Finished,
}

impl ImportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportState::Created => "created",
            ImportState::Queued => "queued",
            ImportState::Downloading => "downloading",
            ImportState::Opening => "opening",
            ImportState::Importing => "importing",
            ImportState::Waiting => "waiting",
            ImportState::Errored => "errored",
            ImportState::Finished => "finished",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ImportState::Opening | ImportState::Importing)
    }

    pub fn can_transition(self, to: ImportState) -> bool {
        use ImportState::*;
        if to == Errored {
            return true;
        }
        matches!(
            (self, to),
            (Created | Waiting | Errored | Finished | Queued, Queued)
                | (Created | Queued | Opening | Waiting | Errored | Finished, Downloading)
                | (Downloading, Created)
                | (Created | Queued | Waiting | Errored | Finished, Opening)
                | (Opening, Importing)
                | (Importing, Waiting | Finished)
                // aborted by cancellation before commit
                | (Opening | Importing, Created)
        )
    }
}

impl fmt::Display for ImportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{file}: cannot move from {from} to {to}")]
pub struct TransitionError {
    pub file: String,
    pub from: ImportState,
    pub to: ImportState,
}

/// Which drive a task reads its file from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrigin {
    #[default]
    Backup,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportOptions {
    pub ignore_missing: bool,
    pub delete_on_finish: bool,
    pub origin: TaskOrigin,
}

impl ImportOptions {
    pub fn restore() -> Self {
        Self {
            ignore_missing: false,
            delete_on_finish: true,
            origin: TaskOrigin::Restore,
        }
    }
}

/// Progress record for one backup file. Handed out as a value snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportTask {
    pub file: FileRef,
    pub state: ImportState,
    pub total_units: Option<usize>,
    pub succeeded: usize,
    pub existing: usize,
    pub deferred: usize,
    pub errored: usize,
    pub downloading_dependents: BTreeSet<FileRef>,
    pub errors: Vec<ImportError>,
    pub options: ImportOptions,
    /// Modification time seen by the last scan.
    pub seen_modified: Option<SystemTime>,
}

impl ImportTask {
    pub fn new(file: FileRef, options: ImportOptions) -> Self {
        Self {
            file,
            state: ImportState::Created,
            total_units: None,
            succeeded: 0,
            existing: 0,
            deferred: 0,
            errored: 0,
            downloading_dependents: BTreeSet::new(),
            errors: Vec::new(),
            options,
            seen_modified: None,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.existing + self.deferred + self.errored
    }

    pub fn progress(&self) -> f64 {
        match self.total_units {
            Some(0) => 1.0,
            Some(total) => self.processed() as f64 / total as f64,
            None => 0.0,
        }
    }

    pub fn reset_counters(&mut self) {
        self.total_units = None;
        self.succeeded = 0;
        self.existing = 0;
        self.deferred = 0;
        self.errored = 0;
        self.downloading_dependents.clear();
        self.errors.clear();
    }

    pub fn has_missing_dependents(&self) -> bool {
        self.errors.iter().any(ImportError::is_missing_dependent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLogEntry {
    pub file: FileRef,
    pub state: ImportState,
    pub errors: Vec<String>,
    pub can_ignore_missing: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    tasks: HashMap<FileRef, ImportTask>,
    missing: BTreeSet<ParentRef>,
}

/// Owned import task table. Every read returns a copy; every write goes
/// through the lock.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, file: &FileRef) -> Option<ImportTask> {
        self.lock().tasks.get(file).cloned()
    }

    /// Creates the task on first reference. Options of an existing task
    /// are kept unless `options` asks for more.
    pub fn ensure(&self, file: &FileRef, options: ImportOptions) -> ImportTask {
        let mut state = self.lock();
        let task = state
            .tasks
            .entry(file.clone())
            .or_insert_with(|| ImportTask::new(file.clone(), options));
        task.options.ignore_missing |= options.ignore_missing;
        task.options.delete_on_finish |= options.delete_on_finish;
        if options.origin == TaskOrigin::Restore {
            task.options.origin = TaskOrigin::Restore;
        }
        task.clone()
    }

    pub fn snapshot_all(&self) -> Vec<ImportTask> {
        let mut tasks: Vec<ImportTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|left, right| left.file.cmp(&right.file));
        tasks
    }

    pub fn update<R>(&self, file: &FileRef, mutation: impl FnOnce(&mut ImportTask) -> R) -> Option<R> {
        self.lock().tasks.get_mut(file).map(mutation)
    }

    /// Moves the task to `to` and returns the previous state.
    pub fn transition(&self, file: &FileRef, to: ImportState) -> Result<ImportState, TransitionError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .entry(file.clone())
            .or_insert_with(|| ImportTask::new(file.clone(), ImportOptions::default()));
        let from = task.state;
        if from == to && to != ImportState::Opening {
            return Ok(from);
        }
        if !from.can_transition(to) {
            return Err(TransitionError {
                file: file.to_string(),
                from,
                to,
            });
        }
        task.state = to;
        Ok(from)
    }

    /// Records what `file` still waits on and moves it to `to` under one
    /// lock, dropping parents that finished meanwhile. Returns true when
    /// the task is left waiting on nothing.
    pub fn settle(
        &self,
        file: &FileRef,
        to: ImportState,
        mut dependents: BTreeSet<FileRef>,
    ) -> Result<bool, TransitionError> {
        let mut state = self.lock();
        dependents.retain(|dependent| {
            state
                .tasks
                .get(dependent)
                .is_none_or(|task| task.state != ImportState::Finished)
        });
        let task = state
            .tasks
            .entry(file.clone())
            .or_insert_with(|| ImportTask::new(file.clone(), ImportOptions::default()));
        let from = task.state;
        if from != to && !from.can_transition(to) {
            return Err(TransitionError {
                file: file.to_string(),
                from,
                to,
            });
        }
        task.state = to;
        task.downloading_dependents = dependents;
        Ok(to == ImportState::Waiting && task.downloading_dependents.is_empty())
    }

    pub fn mark_missing(&self, parent: ParentRef) {
        self.lock().missing.insert(parent);
    }

    pub fn is_missing(&self, parent: &ParentRef) -> bool {
        self.lock().missing.contains(parent)
    }

    pub fn clear_missing(&self, parent: &ParentRef) -> bool {
        self.lock().missing.remove(parent)
    }

    pub fn missing(&self) -> Vec<ParentRef> {
        self.lock().missing.iter().copied().collect()
    }

    /// Drops `finished` from every task waiting on it. Returns the waiting
    /// tasks that have nothing left to wait for.
    pub fn release_dependents(&self, finished: &FileRef) -> Vec<FileRef> {
        let mut state = self.lock();
        let mut released = Vec::new();
        for task in state.tasks.values_mut() {
            if !task.downloading_dependents.remove(finished) {
                continue;
            }
            if task.downloading_dependents.is_empty() && task.state == ImportState::Waiting {
                released.push(task.file.clone());
            }
        }
        released.sort();
        released
    }

    pub fn files_in(&self, states: &[ImportState]) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self
            .lock()
            .tasks
            .values()
            .filter(|task| states.contains(&task.state))
            .map(|task| task.file.clone())
            .collect();
        files.sort();
        files
    }

    /// One entry per file with errors; descriptions are deduplicated.
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        let mut entries: Vec<ErrorLogEntry> = self
            .lock()
            .tasks
            .values()
            .filter(|task| !task.errors.is_empty())
            .map(|task| {
                let errors: BTreeSet<String> =
                    task.errors.iter().map(ToString::to_string).collect();
                ErrorLogEntry {
                    file: task.file.clone(),
                    state: task.state,
                    errors: errors.into_iter().collect(),
                    can_ignore_missing: task.has_missing_dependents(),
                }
            })
            .collect();
        entries.sort_by(|left, right| left.file.cmp(&right.file));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locosync_core::ObjectKind;
    use uuid::Uuid;

    fn file() -> FileRef {
        FileRef::for_object(ObjectKind::Note, Uuid::new_v4())
    }

    #[test]
    fn normal_path_is_allowed() {
        let tracker = TaskTracker::new();
        let file = file();
        tracker.ensure(&file, ImportOptions::default());
        for state in [
            ImportState::Queued,
            ImportState::Opening,
            ImportState::Importing,
            ImportState::Finished,
        ] {
            tracker.transition(&file, state).unwrap();
        }
        assert_eq!(tracker.get(&file).unwrap().state, ImportState::Finished);
    }

    #[test]
    fn download_round_trip_re_enters_pipeline() {
        let tracker = TaskTracker::new();
        let file = file();
        tracker.transition(&file, ImportState::Downloading).unwrap();
        assert!(tracker.transition(&file, ImportState::Opening).is_err());
        tracker.transition(&file, ImportState::Created).unwrap();
        tracker.transition(&file, ImportState::Opening).unwrap();
    }

    #[test]
    fn rejects_skipping_states() {
        let tracker = TaskTracker::new();
        let file = file();
        tracker.ensure(&file, ImportOptions::default());
        let err = tracker
            .transition(&file, ImportState::Finished)
            .unwrap_err();
        assert_eq!(err.from, ImportState::Created);
        assert_eq!(err.to, ImportState::Finished);

        tracker.transition(&file, ImportState::Opening).unwrap();
        assert!(tracker.transition(&file, ImportState::Opening).is_err());
        tracker.transition(&file, ImportState::Errored).unwrap();
    }

    #[test]
    fn release_returns_tasks_with_nothing_left() {
        let tracker = TaskTracker::new();
        let parent_a = file();
        let parent_b = file();
        let child = file();
        tracker.ensure(&child, ImportOptions::default());
        tracker.update(&child, |task| {
            task.state = ImportState::Waiting;
            task.downloading_dependents.insert(parent_a.clone());
            task.downloading_dependents.insert(parent_b.clone());
        });

        assert!(tracker.release_dependents(&parent_a).is_empty());
        assert_eq!(tracker.release_dependents(&parent_b), vec![child.clone()]);
        assert!(tracker.get(&child).unwrap().downloading_dependents.is_empty());
    }

    #[test]
    fn settle_drops_parents_that_already_finished() {
        let tracker = TaskTracker::new();
        let parent = file();
        let child = file();
        for state in [ImportState::Opening, ImportState::Importing, ImportState::Finished] {
            tracker.transition(&parent, state).unwrap();
        }
        for state in [ImportState::Opening, ImportState::Importing] {
            tracker.transition(&child, state).unwrap();
        }

        let idle = tracker
            .settle(&child, ImportState::Waiting, BTreeSet::from([parent]))
            .unwrap();
        assert!(idle);
        let task = tracker.get(&child).unwrap();
        assert_eq!(task.state, ImportState::Waiting);
        assert!(task.downloading_dependents.is_empty());
    }

    #[test]
    fn error_log_groups_and_dedupes() {
        let tracker = TaskTracker::new();
        let file = file();
        let parent = ParentRef {
            kind: ObjectKind::TimelineItem,
            id: Uuid::new_v4(),
        };
        let child = Uuid::new_v4();
        tracker.ensure(&file, ImportOptions::default());
        tracker.update(&file, |task| {
            task.state = ImportState::Errored;
            task.errors.push(ImportError::MissingDependentFile { parent, child });
            task.errors.push(ImportError::MissingDependentFile { parent, child });
            task.errors.push(ImportError::Io("disk full".into()));
        });

        let log = tracker.error_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].errors.len(), 2);
        assert!(log[0].can_ignore_missing);
    }

    #[test]
    fn progress_counts_every_outcome() {
        let mut task = ImportTask::new(file(), ImportOptions::default());
        assert_eq!(task.progress(), 0.0);
        task.total_units = Some(4);
        task.succeeded = 1;
        task.existing = 1;
        task.deferred = 1;
        task.errored = 1;
        assert_eq!(task.progress(), 1.0);
    }
}
