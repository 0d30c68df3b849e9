use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::drive::{CloudDrive, DriveEvent, LocalDrive, start_drive_watcher};
use crate::store::{LocalStore, SqliteStore};
use crate::sync::backoff::Backoff;
use crate::sync::scheduler::SchedulerConfig;
use crate::sync::{ErrorLogEntry, RestoreStatus, RunMode, RunOutcome, SyncEngine};

const DEFAULT_BACKUP_DIR_NAME: &str = "LocoSync Backups";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15 * 60;
const DEFAULT_RUN_BUDGET_SECS: u64 = 5 * 60;
const DEFAULT_MIN_RUN_INTERVAL_SECS: u64 = 6 * 60 * 60;
const RESCHEDULE_BASE_SECS: u64 = 30;
const RESCHEDULE_MAX_SECS: u64 = 15 * 60;
const DATABASE_FILE: &str = "locosync.sqlite";
const RUN_STATE_FILE: &str = "run-state.json";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub backup_root: PathBuf,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub run_budget: Duration,
    pub min_run_interval: Duration,
    pub enable_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let backup_root = std::env::var("LOCOSYNC_BACKUP_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_BACKUP_DIR_NAME));
        let data_dir = std::env::var("LOCOSYNC_DATA_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_data_dir);
        let sync_interval = Duration::from_secs(read_u64_env(
            "LOCOSYNC_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        ));
        let run_budget = Duration::from_secs(read_u64_env(
            "LOCOSYNC_RUN_BUDGET_SECS",
            DEFAULT_RUN_BUDGET_SECS,
        ));
        let min_run_interval = Duration::from_secs(read_u64_env(
            "LOCOSYNC_MIN_RUN_INTERVAL_SECS",
            DEFAULT_MIN_RUN_INTERVAL_SECS,
        ));
        let enable_watcher = read_bool_env("LOCOSYNC_ENABLE_WATCHER", true);

        Ok(Self {
            backup_root,
            data_dir,
            sync_interval,
            run_budget,
            min_run_interval,
            enable_watcher,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn import_dir(&self) -> PathBuf {
        self.data_dir.join("import")
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.data_dir.join(RUN_STATE_FILE)
    }
}

/// Which errored files a retry puts back on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    Errored,
    /// Only files with missing parents; those references are severed.
    IgnoringMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub retried: usize,
    pub remaining: Vec<ErrorLogEntry>,
}

/// What survives restarts: when the last full run completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_completed: Option<OffsetDateTime>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        for dir in [&config.backup_root, &config.data_dir, &config.import_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let store = SqliteStore::open(&config.database_path())
            .await
            .context("failed to open local store")?;
        let store: Arc<dyn LocalStore> = Arc::new(store);
        let backup_drive: Arc<dyn CloudDrive> = Arc::new(LocalDrive::new(
            config.backup_root.clone(),
            config.staging_dir(),
        ));
        let import_drive: Arc<dyn CloudDrive> = Arc::new(LocalDrive::new(
            config.import_dir(),
            config.staging_dir(),
        ));
        let scheduler = SchedulerConfig {
            min_run_interval: config.min_run_interval,
            ..SchedulerConfig::default()
        };
        let engine = SyncEngine::with_config(store, backup_drive, import_drive, scheduler);

        let state = load_run_state(&config.run_state_path()).await?;
        engine.set_last_completed(state.last_completed);

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Periodic full runs until interrupted, plus import runs on drive
    /// changes when the watcher is enabled.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            backup_root = %self.config.backup_root.display(),
            data_dir = %self.config.data_dir.display(),
            watcher = self.config.enable_watcher,
            "locosyncd started"
        );
        // Held for the daemon's lifetime so runs never close the store.
        let _lease = self.engine.store().acquire();

        let (watcher, drive_rx): (
            Option<notify::RecommendedWatcher>,
            Option<mpsc::UnboundedReceiver<DriveEvent>>,
        ) = if self.config.enable_watcher {
            match start_drive_watcher(&self.config.backup_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start drive watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };
        let watching = drive_rx.is_some();

        let events_handle = drive_rx.map(|mut rx| {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    engine.handle_drive_event(event);
                }
            })
        });

        let engine = self.engine.clone();
        let config = self.config.clone();
        let sync_handle = tokio::spawn(async move {
            let backoff = Backoff::new(
                Duration::from_secs(RESCHEDULE_BASE_SECS),
                Duration::from_secs(RESCHEDULE_MAX_SECS),
                true,
            );
            let mut attempt = 0u32;
            let mut first = true;
            loop {
                match run_budgeted(&engine, RunMode::Full, config.run_budget).await {
                    Ok(outcome) => {
                        if let Err(err) = persist_last_completed(&engine, &config).await {
                            warn!(error = %err, "failed to save run state");
                        }
                        if first && watching && outcome == RunOutcome::Completed {
                            engine.handle_drive_event(DriveEvent::GatheringFinished);
                        }
                    }
                    Err(err) => warn!(error = %err, "sync run failed"),
                }
                first = false;

                let delay = if engine.take_reschedule_request() {
                    attempt = attempt.saturating_add(1);
                    backoff.delay(attempt)
                } else {
                    attempt = 0;
                    config.sync_interval
                };
                tokio::time::sleep(delay).await;
            }
        });

        let _watcher = watcher;
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        sync_handle.abort();
        if let Some(handle) = events_handle {
            handle.abort();
        }
        Ok(())
    }

    /// One full pass within the run budget, ignoring the rate limit.
    pub async fn run_once(self) -> anyhow::Result<RunOutcome> {
        self.engine.set_last_completed(None);
        let outcome = run_budgeted(&self.engine, RunMode::Full, self.config.run_budget).await?;
        persist_last_completed(&self.engine, &self.config).await?;
        Ok(outcome)
    }

    pub async fn restore(self, source_dir: &Path) -> anyhow::Result<RestoreStatus> {
        let source = LocalDrive::new(source_dir, self.config.staging_dir());
        let status = self
            .engine
            .restore_from(&source)
            .await
            .with_context(|| format!("failed to restore from {}", source_dir.display()))?;
        if let RestoreStatus::Queued { .. } = status {
            run_budgeted(&self.engine, RunMode::Import, self.config.run_budget).await?;
        }
        Ok(status)
    }

    /// Runs an import pass and returns the resulting error log.
    pub async fn error_report(self) -> anyhow::Result<Vec<ErrorLogEntry>> {
        run_budgeted(&self.engine, RunMode::Import, self.config.run_budget).await?;
        Ok(self.engine.error_log())
    }

    /// Finds the errored files with an import pass, re-queues the ones in
    /// `scope` and imports them again.
    pub async fn retry(self, scope: RetryScope) -> anyhow::Result<RetryReport> {
        run_budgeted(&self.engine, RunMode::Import, self.config.run_budget).await?;
        let retried = match scope {
            RetryScope::Errored => self.engine.retry_errored(),
            RetryScope::IgnoringMissing => self.engine.retry_ignoring_missing(),
        };
        info!(retried, ?scope, "retrying errored imports");
        if retried > 0 {
            run_budgeted(&self.engine, RunMode::Import, self.config.run_budget).await?;
        }
        Ok(RetryReport {
            retried,
            remaining: self.engine.error_log(),
        })
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
