pub mod backoff;
pub mod change;
mod conflict;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod guard;
mod importer;
pub mod queue;
pub mod resolver;
pub mod restore;
pub mod scanner;
pub mod scheduler;
pub mod tasks;
mod writer;

pub use conflict::{MergeDecision, decide};
pub use engine::SyncEngine;
pub use error::{ImportError, SyncError};
pub use restore::RestoreStatus;
pub use scheduler::{RunMode, RunOutcome, SchedulerConfig};
pub use tasks::{ErrorLogEntry, ImportOptions, ImportState, ImportTask, TaskOrigin};
