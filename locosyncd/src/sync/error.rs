use locosync_core::{CodecError, ParentRef};
use thiserror::Error;
use uuid::Uuid;

use crate::drive::DriveError;
use crate::store::StoreError;

use super::tasks::TransitionError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("task error: {0}")]
    Transition(#[from] TransitionError),
    #[error("run was cancelled")]
    Cancelled,
    #[error("no backup files found under {0}")]
    NothingToRestore(String),
}

/// Failure of one file or one unit inside a file, kept on the task for the
/// error log. Cloneable so snapshots can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("unreadable file: {0}")]
    Decode(String),
    #[error("{child} references {parent}, which could not be found")]
    MissingDependentFile { parent: ParentRef, child: Uuid },
    #[error("{id} has no lastSaved to supersede the local copy")]
    StaleWriteRejected { id: Uuid },
    #[error("I/O failure: {0}")]
    Io(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("dependency chain too deep at {parent}")]
    DependencyDepth { parent: ParentRef },
}

impl ImportError {
    pub fn is_missing_dependent(&self) -> bool {
        matches!(self, ImportError::MissingDependentFile { .. })
    }
}

impl From<CodecError> for ImportError {
    fn from(value: CodecError) -> Self {
        ImportError::Decode(value.to_string())
    }
}

impl From<DriveError> for ImportError {
    fn from(value: DriveError) -> Self {
        ImportError::Io(value.to_string())
    }
}

impl From<StoreError> for ImportError {
    fn from(value: StoreError) -> Self {
        ImportError::Store(value.to_string())
    }
}

impl From<&SyncError> for ImportError {
    fn from(value: &SyncError) -> Self {
        match value {
            SyncError::Codec(err) => ImportError::Decode(err.to_string()),
            SyncError::Store(err) => ImportError::Store(err.to_string()),
            other => ImportError::Io(other.to_string()),
        }
    }
}
