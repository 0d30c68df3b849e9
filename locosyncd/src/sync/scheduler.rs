use std::collections::{HashMap, HashSet};
use std::env;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use locosync_core::{IsoWeek, ObjectKind, Syncable};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker as JobTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::change::{pending_count_of, pending_objects, pending_weeks};
use super::engine::SyncEngine;
use super::error::SyncError;

const DEFAULT_POOL_CONCURRENCY: usize = 2;
const DEFAULT_BATCH_DELAY_MS: u64 = 250;
const DEFAULT_DEBOUNCE_MS: u64 = 500;
const DEFAULT_MAX_IDLE_TICKS: u32 = 3;
const DEFAULT_MIN_RUN_INTERVAL_SECS: u64 = 6 * 60 * 60;
const IMPORT_BATCH: usize = 20;
const SAMPLE_IMPORT_BATCH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub pool_concurrency: usize,
    pub batch_delay: Duration,
    pub debounce: Duration,
    pub max_idle_ticks: u32,
    pub min_run_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_concurrency: read_limit("LOCOSYNC_POOL_CONCURRENCY", DEFAULT_POOL_CONCURRENCY),
            batch_delay: Duration::from_millis(read_millis(
                "LOCOSYNC_BATCH_DELAY_MS",
                DEFAULT_BATCH_DELAY_MS,
            )),
            debounce: Duration::from_millis(read_millis(
                "LOCOSYNC_DEBOUNCE_MS",
                DEFAULT_DEBOUNCE_MS,
            )),
            max_idle_ticks: DEFAULT_MAX_IDLE_TICKS,
            min_run_interval: Duration::from_secs(DEFAULT_MIN_RUN_INTERVAL_SECS),
        }
    }
}

fn read_limit(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_millis(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Backup,
    Import,
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Backup => "backup",
            RunMode::Import => "import",
            RunMode::Full => "full",
        }
    }

    pub fn backs_up(&self) -> bool {
        matches!(self, RunMode::Backup | RunMode::Full)
    }

    pub fn imports(&self) -> bool {
        matches!(self, RunMode::Import | RunMode::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Unfinished,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Unfinished => "unfinished",
        }
    }
}

/// Bounded set of workers. Jobs that have not started when the pool is
/// cancelled are dropped without running. Clones share workers.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    jobs: JobTracker,
    cancel: CancellationToken,
    progressed: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &'static str, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            jobs: JobTracker::new(),
            cancel,
            progressed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `job` resolves to whether it moved anything forward.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let progressed = Arc::clone(&self.progressed);
        let name = self.name;
        self.jobs.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if cancel.is_cancelled() {
                debug!(pool = name, "dropping queued job");
                return;
            }
            if job.await {
                progressed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    pub async fn drain(&self) {
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    pub fn take_progress(&self) -> usize {
        self.progressed.swap(0, Ordering::SeqCst)
    }
}

/// Two pools so the numerous sample weeks never starve the small kinds.
pub struct BatchScheduler {
    small: WorkerPool,
    samples: WorkerPool,
    cancel: CancellationToken,
}

impl BatchScheduler {
    pub fn new(config: &SchedulerConfig, cancel: CancellationToken) -> Self {
        Self {
            small: WorkerPool::new("small", config.pool_concurrency, cancel.clone()),
            samples: WorkerPool::new("samples", config.pool_concurrency, cancel.clone()),
            cancel,
        }
    }

    pub fn pool_for(&self, kind: ObjectKind) -> &WorkerPool {
        match kind {
            ObjectKind::Sample => &self.samples,
            _ => &self.small,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.small.cancel();
        self.samples.cancel();
    }

    pub async fn wait(&self) {
        self.small.drain().await;
        self.samples.drain().await;
    }

    pub fn take_progress(&self) -> usize {
        self.small.take_progress() + self.samples.take_progress()
    }
}

fn import_batch(kind: ObjectKind) -> usize {
    match kind {
        ObjectKind::Sample => SAMPLE_IMPORT_BATCH,
        _ => IMPORT_BATCH,
    }
}

/// What the change-detection jobs of one run have seen so far.
#[derive(Debug, Default)]
struct BackupLedger {
    tried_objects: Mutex<HashMap<ObjectKind, HashSet<Uuid>>>,
    tried_weeks: Mutex<HashSet<IsoWeek>>,
    /// Pending count per kind as of the last detection.
    pending: Mutex<HashMap<ObjectKind, usize>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BackupLedger {
    fn pending(&self) -> usize {
        locked(&self.pending).values().sum()
    }

    fn set_pending(&self, kind: ObjectKind, count: usize) {
        locked(&self.pending).insert(kind, count);
    }
}

impl SyncEngine {
    /// Tick loop: enqueue one bounded batch per kind, wait for it, then
    /// either finish, give up after idle ticks, or sleep and go again.
    /// Store and drive I/O happens on the pools only.
    pub(super) async fn run_batches(
        &self,
        mode: RunMode,
        scheduler: &BatchScheduler,
    ) -> Result<RunOutcome, SyncError> {
        let ledger = Arc::new(BackupLedger::default());
        let mut idle_ticks = 0u32;
        let mut tick = 0u64;

        loop {
            if scheduler.is_cancelled() {
                return Ok(RunOutcome::Unfinished);
            }
            tick += 1;
            let mut enqueued = 0usize;
            for kind in ObjectKind::ALL {
                if mode.backs_up() {
                    self.enqueue_backups(kind, scheduler, &ledger);
                    enqueued += 1;
                }
                if mode.imports() {
                    enqueued += self.enqueue_imports(kind, scheduler);
                }
            }
            scheduler.wait().await;
            if scheduler.is_cancelled() {
                return Ok(RunOutcome::Unfinished);
            }
            let progressed = scheduler.take_progress();

            let remaining = self.remaining_work(mode, &ledger);
            debug!(tick, enqueued, progressed, remaining, "scheduler tick");
            if remaining == 0 {
                return Ok(RunOutcome::Completed);
            }
            if progressed == 0 {
                idle_ticks += 1;
                if idle_ticks >= self.config.max_idle_ticks {
                    debug!(remaining, "no progress, leaving the rest for the next run");
                    return Ok(RunOutcome::Unfinished);
                }
            } else {
                idle_ticks = 0;
            }

            let cancel = scheduler.token();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(RunOutcome::Unfinished),
                _ = tokio::time::sleep(self.config.batch_delay) => {}
            }
        }
    }

    /// Queues a detection job for `kind`; it counts what is pending and
    /// queues one backup job per fresh object or week on the same pool.
    fn enqueue_backups(
        &self,
        kind: ObjectKind,
        scheduler: &BatchScheduler,
        ledger: &Arc<BackupLedger>,
    ) {
        let pool = scheduler.pool_for(kind).clone();
        let engine = self.clone();
        let ledger = Arc::clone(ledger);
        scheduler.pool_for(kind).spawn(async move {
            match engine.detect_backups(kind, &pool, &ledger).await {
                Ok(queued) => debug!(%kind, queued, "backups queued"),
                Err(err) => {
                    // unknown counts as pending so the run cannot complete
                    warn!(%kind, error = %err, "change detection failed");
                    ledger.set_pending(kind, 1);
                }
            }
            false
        });
    }

    async fn detect_backups(
        &self,
        kind: ObjectKind,
        pool: &WorkerPool,
        ledger: &BackupLedger,
    ) -> Result<usize, SyncError> {
        let store = self.store.as_ref();
        ledger.set_pending(kind, pending_count_of(store, kind).await?);

        if kind == ObjectKind::Sample {
            let skip = locked(&ledger.tried_weeks).clone();
            let weeks = pending_weeks(store, &skip).await?;
            locked(&ledger.tried_weeks).extend(weeks.iter().copied());
            for week in &weeks {
                let engine = self.clone();
                let week = *week;
                pool.spawn(async move {
                    match engine.backup_week(week).await {
                        Ok(written) => written,
                        Err(err) => {
                            warn!(%week, error = %err, "sample week backup failed");
                            false
                        }
                    }
                });
            }
            return Ok(weeks.len());
        }

        let skip = locked(&ledger.tried_objects)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        let objects = pending_objects(store, kind, &skip).await?;
        locked(&ledger.tried_objects)
            .entry(kind)
            .or_default()
            .extend(objects.iter().map(Syncable::object_id));
        let count = objects.len();
        for object in objects {
            let engine = self.clone();
            pool.spawn(async move {
                match engine.backup_object(&object).await {
                    Ok(written) => written,
                    Err(err) => {
                        warn!(
                            kind = %object.kind(),
                            id = %object.object_id(),
                            error = %err,
                            "object backup failed"
                        );
                        false
                    }
                }
            });
        }
        Ok(count)
    }

    fn enqueue_imports(&self, kind: ObjectKind, scheduler: &BatchScheduler) -> usize {
        let files = self.pop_imports(kind, import_batch(kind));
        let count = files.len();
        let pool = scheduler.pool_for(kind);
        for file in files {
            let engine = self.clone();
            let cancel = scheduler.token();
            pool.spawn(async move {
                match engine.import_queued(&file, &cancel).await {
                    Ok(_) => true,
                    Err(SyncError::Cancelled) => false,
                    Err(err) => {
                        warn!(%file, error = %err, "import failed");
                        false
                    }
                }
            });
        }
        count
    }

    /// Backup counts come from the detection jobs, so they trail the tick's
    /// own writes by one tick.
    fn remaining_work(&self, mode: RunMode, ledger: &BackupLedger) -> usize {
        let mut remaining = 0;
        if mode.backs_up() {
            remaining += ledger.pending();
        }
        if mode.imports() {
            remaining += self.queued_imports();
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_limits_concurrency() {
        let pool = WorkerPool::new("test", 2, CancellationToken::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                true
            });
        }
        pool.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.take_progress(), 6);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_pool_drops_queued_jobs() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new("test", 1, cancel.clone());
        let started = Arc::new(AtomicUsize::new(0));
        cancel.cancel();
        for _ in 0..3 {
            let started = Arc::clone(&started);
            pool.spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        pool.drain().await;
        assert_eq!(started.load(Ordering::SeqCst), 0);
        assert_eq!(pool.take_progress(), 0);
    }

    #[tokio::test]
    async fn jobs_can_queue_follow_up_jobs_while_draining() {
        let pool = WorkerPool::new("test", 1, CancellationToken::new());
        let spawner = pool.clone();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        pool.spawn(async move {
            for _ in 0..3 {
                let counter = Arc::clone(&counter);
                spawner.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                });
            }
            false
        });
        pool.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(pool.take_progress(), 3);
    }

    #[test]
    fn ledger_sums_latest_count_per_kind() {
        let ledger = BackupLedger::default();
        assert_eq!(ledger.pending(), 0);
        ledger.set_pending(ObjectKind::Note, 4);
        ledger.set_pending(ObjectKind::Sample, 2);
        ledger.set_pending(ObjectKind::Note, 1);
        assert_eq!(ledger.pending(), 3);
    }

    #[test]
    fn modes_cover_directions() {
        assert!(RunMode::Full.backs_up() && RunMode::Full.imports());
        assert!(!RunMode::Backup.imports());
        assert!(!RunMode::Import.backs_up());
    }
}
