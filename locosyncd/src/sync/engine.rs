use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use locosync_core::{FileRef, ObjectKind, Timestamp};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::error::SyncError;
use super::guard::ExecutionGuard;
use super::queue::ImportQueue;
use super::scheduler::{BatchScheduler, RunMode, RunOutcome, SchedulerConfig};
use super::tasks::{ErrorLogEntry, ImportOptions, ImportState, ImportTask, TaskOrigin, TaskTracker};
use crate::drive::{CloudDrive, DriveEvent};
use crate::store::LocalStore;

const DRIVE_EVENTS_KEY: &str = "drive-changes";

/// Bidirectional sync between the local store and the backup drive.
///
/// Cheap to clone; clones share every piece of state.
#[derive(Clone)]
pub struct SyncEngine {
    pub(super) store: Arc<dyn LocalStore>,
    pub(super) backup_drive: Arc<dyn CloudDrive>,
    pub(super) import_drive: Arc<dyn CloudDrive>,
    pub(super) tasks: TaskTracker,
    pub(super) config: SchedulerConfig,
    queue: Arc<Mutex<ImportQueue>>,
    guard: Arc<ExecutionGuard>,
    debouncer: Debouncer,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SyncEngine {
    /// `import_drive` holds transient files copied in by a managed restore.
    pub fn new(
        store: Arc<dyn LocalStore>,
        backup_drive: Arc<dyn CloudDrive>,
        import_drive: Arc<dyn CloudDrive>,
    ) -> Self {
        Self::with_config(store, backup_drive, import_drive, SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn LocalStore>,
        backup_drive: Arc<dyn CloudDrive>,
        import_drive: Arc<dyn CloudDrive>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            backup_drive,
            import_drive,
            tasks: TaskTracker::new(),
            config,
            queue: Arc::new(Mutex::new(ImportQueue::default())),
            guard: Arc::new(ExecutionGuard::new(config.min_run_interval)),
            debouncer: Debouncer::new(config.debounce),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub(super) fn drive_for(&self, origin: TaskOrigin) -> &Arc<dyn CloudDrive> {
        match origin {
            TaskOrigin::Backup => &self.backup_drive,
            TaskOrigin::Restore => &self.import_drive,
        }
    }

    fn queue(&self) -> MutexGuard<'_, ImportQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One sync pass. `expiration` is the host's "time is running out"
    /// signal; cancelling it ends the run as unfinished.
    pub async fn run_sync(
        &self,
        mode: RunMode,
        expiration: &CancellationToken,
    ) -> Result<RunOutcome, SyncError> {
        let _running = self.run_lock.lock().await;
        if mode == RunMode::Full && !self.guard.should_run(OffsetDateTime::now_utc()) {
            debug!("full run skipped, last one completed recently");
            return Ok(RunOutcome::Completed);
        }

        info!(mode = mode.as_str(), "sync run started");
        let scheduler = BatchScheduler::new(&self.config, expiration.child_token());
        let result = self
            .guard
            .run(
                self.store.as_ref(),
                &scheduler,
                expiration,
                mode == RunMode::Full,
                async {
                    if mode.imports() {
                        let report = self.scan().await?;
                        debug!(
                            queued = report.queued,
                            downloads_completed = report.downloads_completed,
                            released = report.released,
                            restored = report.restored,
                            "scan finished"
                        );
                    }
                    self.run_batches(mode, &scheduler).await
                },
            )
            .await;

        match &result {
            Ok(outcome) => info!(mode = mode.as_str(), outcome = outcome.as_str(), "sync run ended"),
            Err(err) => warn!(mode = mode.as_str(), error = %err, "sync run failed"),
        }
        result
    }

    pub fn full_run_due(&self) -> bool {
        self.guard.should_run(OffsetDateTime::now_utc())
    }

    pub fn last_completed(&self) -> Option<Timestamp> {
        self.guard.last_completed()
    }

    pub fn set_last_completed(&self, at: Option<Timestamp>) {
        self.guard.set_last_completed(at);
    }

    pub fn take_reschedule_request(&self) -> bool {
        self.guard.take_reschedule_request()
    }

    /// Coalesces bursts of change notifications into one import run.
    pub fn handle_drive_event(&self, event: DriveEvent) {
        match &event {
            DriveEvent::Changed { paths } => debug!(paths = paths.len(), "drive changed"),
            DriveEvent::GatheringFinished => debug!("drive gathering finished"),
        }
        let engine = self.clone();
        self.debouncer.submit(DRIVE_EVENTS_KEY, async move {
            let expiration = CancellationToken::new();
            if let Err(err) = engine.run_sync(RunMode::Import, &expiration).await {
                warn!(error = %err, "import after drive change failed");
            }
        });
    }

    pub fn tasks(&self) -> Vec<ImportTask> {
        self.tasks.snapshot_all()
    }

    pub fn task(&self, file: &FileRef) -> Option<ImportTask> {
        self.tasks.get(file)
    }

    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        self.tasks.error_log()
    }

    pub fn missing_parents(&self) -> Vec<locosync_core::ParentRef> {
        self.tasks.missing()
    }

    /// Re-queues every errored file. Returns how many were queued.
    pub fn retry_errored(&self) -> usize {
        self.tasks
            .files_in(&[ImportState::Errored])
            .into_iter()
            .filter(|file| self.enqueue_import(file, ImportOptions::default()))
            .count()
    }

    /// Re-queues errored files with missing parents, severing those
    /// references on the next import.
    pub fn retry_ignoring_missing(&self) -> usize {
        let options = ImportOptions {
            ignore_missing: true,
            ..ImportOptions::default()
        };
        self.tasks
            .files_in(&[ImportState::Errored])
            .into_iter()
            .filter(|file| {
                self.tasks
                    .get(file)
                    .is_some_and(|task| task.has_missing_dependents())
            })
            .filter(|file| self.enqueue_import(file, options))
            .count()
    }

    /// Creates or reuses the task and puts the file on the pending queue.
    /// Files being imported right now are left alone. Returns false when
    /// nothing new was queued.
    pub fn enqueue_import(&self, file: &FileRef, options: ImportOptions) -> bool {
        self.tasks.ensure(file, options);
        if let Err(err) = self.tasks.transition(file, ImportState::Queued) {
            debug!(%file, error = %err, "not queueing");
            return false;
        }
        self.queue().enqueue(file.clone())
    }

    pub(super) fn pop_imports(&self, kind: ObjectKind, max: usize) -> Vec<FileRef> {
        self.queue().pop_batch(kind, max)
    }

    pub fn queued_imports(&self) -> usize {
        self.queue().len()
    }
}

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;
