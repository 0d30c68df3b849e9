use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use locosync_core::Timestamp;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::SyncError;
use super::scheduler::{BatchScheduler, RunOutcome};
use crate::store::LocalStore;

/// Wraps a scheduler run with the host's expiration signal and remembers
/// when a full run last completed.
#[derive(Debug)]
pub struct ExecutionGuard {
    min_interval: Duration,
    last_completed: Mutex<Option<Timestamp>>,
    reschedule: AtomicBool,
}

impl ExecutionGuard {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_completed: Mutex::new(None),
            reschedule: AtomicBool::new(false),
        }
    }

    pub fn last_completed(&self) -> Option<Timestamp> {
        *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_last_completed(&self, at: Option<Timestamp>) {
        *self
            .last_completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn should_run(&self, now: Timestamp) -> bool {
        match self.last_completed() {
            Some(last) => now - last >= self.min_interval,
            None => true,
        }
    }

    /// True once after a run ended unfinished.
    pub fn take_reschedule_request(&self) -> bool {
        self.reschedule.swap(false, Ordering::SeqCst)
    }

    pub async fn run<F>(
        &self,
        store: &dyn LocalStore,
        scheduler: &BatchScheduler,
        expiration: &CancellationToken,
        record_completion: bool,
        run: F,
    ) -> Result<RunOutcome, SyncError>
    where
        F: Future<Output = Result<RunOutcome, SyncError>>,
    {
        let lease = store.acquire();
        let result = tokio::select! {
            biased;
            _ = expiration.cancelled() => {
                warn!("execution time expired, cancelling outstanding work");
                Ok(RunOutcome::Unfinished)
            }
            result = run => result,
        };
        scheduler.cancel();
        scheduler.wait().await;
        drop(lease);

        match &result {
            Ok(RunOutcome::Completed) => {
                if record_completion {
                    self.set_last_completed(Some(OffsetDateTime::now_utc()));
                }
                self.reschedule.store(false, Ordering::SeqCst);
            }
            Ok(RunOutcome::Unfinished) | Err(_) => {
                self.reschedule.store(true, Ordering::SeqCst);
                if store.close_if_idle().await {
                    info!("closed local store, no consumer left");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::sync::scheduler::SchedulerConfig;
    use time::macros::datetime;

    #[test]
    fn rate_limits_full_runs() {
        let guard = ExecutionGuard::new(Duration::from_secs(3600));
        assert!(guard.should_run(datetime!(2024-05-01 10:00 UTC)));
        guard.set_last_completed(Some(datetime!(2024-05-01 10:00 UTC)));
        assert!(!guard.should_run(datetime!(2024-05-01 10:30 UTC)));
        assert!(guard.should_run(datetime!(2024-05-01 11:00 UTC)));
    }

    #[tokio::test]
    async fn expiry_cancels_and_requests_continuation() {
        let guard = ExecutionGuard::new(Duration::from_secs(3600));
        let store = SqliteStore::in_memory().await.unwrap();
        let expiration = CancellationToken::new();
        let scheduler = BatchScheduler::new(&SchedulerConfig::default(), expiration.child_token());
        let keep_open = store.acquire();
        expiration.cancel();

        let outcome = guard
            .run(&store, &scheduler, &expiration, true, async {
                std::future::pending::<Result<RunOutcome, SyncError>>().await
            })
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Unfinished);
        assert!(scheduler.is_cancelled());
        assert!(guard.take_reschedule_request());
        assert!(!guard.take_reschedule_request());
        assert_eq!(guard.last_completed(), None);
        assert!(!store.is_closed());
        drop(keep_open);
    }

    #[tokio::test]
    async fn completion_records_timestamp_and_closes_nothing() {
        let guard = ExecutionGuard::new(Duration::from_secs(3600));
        let store = SqliteStore::in_memory().await.unwrap();
        let expiration = CancellationToken::new();
        let scheduler = BatchScheduler::new(&SchedulerConfig::default(), expiration.child_token());

        let outcome = guard
            .run(&store, &scheduler, &expiration, true, async {
                Ok(RunOutcome::Completed)
            })
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert!(guard.last_completed().is_some());
        assert!(!guard.take_reschedule_request());
        assert!(!store.is_closed());
    }

    #[tokio::test]
    async fn unfinished_run_closes_idle_store_until_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ExecutionGuard::new(Duration::from_secs(3600));
        let store = SqliteStore::open(&dir.path().join("objects.sqlite"))
            .await
            .unwrap();

        let expiration = CancellationToken::new();
        let scheduler = BatchScheduler::new(&SchedulerConfig::default(), expiration.child_token());
        let outcome = guard
            .run(&store, &scheduler, &expiration, true, async {
                Ok(RunOutcome::Unfinished)
            })
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Unfinished);
        assert!(store.is_closed());

        let expiration = CancellationToken::new();
        let scheduler = BatchScheduler::new(&SchedulerConfig::default(), expiration.child_token());
        let outcome = guard
            .run(&store, &scheduler, &expiration, true, async {
                let pending = store
                    .count(locosync_core::ObjectKind::Note, &crate::store::StoreQuery::new())
                    .await?;
                assert_eq!(pending, 0);
                Ok(RunOutcome::Completed)
            })
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(!store.is_closed());
    }
}
