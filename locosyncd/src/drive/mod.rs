use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

mod local;
pub mod paths;
pub mod watcher;

pub use local::LocalDrive;
pub use paths::PathError;
pub use watcher::{DriveEvent, start_drive_watcher};

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("{0} is not downloaded yet")]
    DownloadPending(PathBuf),
    #[error("{0} appeared while publishing a new file")]
    AlreadyExists(PathBuf),
    #[error("{0} does not exist")]
    NotFound(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Missing,
    Placeholder,
    Present,
}

/// A leaf file of the synced tree. `path` is relative to the drive root and
/// keeps its on-disk (possibly placeholder) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEntry {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
}

/// The cloud-synced directory tree shared with other devices.
///
/// All paths are relative to the drive root and name the data file, never
/// its placeholder form.
#[async_trait]
pub trait CloudDrive: Send + Sync {
    fn root(&self) -> &Path;

    /// Recursive listing of `dir`, including placeholders.
    async fn list(&self, dir: &Path) -> Result<Vec<DriveEntry>, DriveError>;

    async fn status(&self, path: &Path) -> Result<EntryStatus, DriveError>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, DriveError>;

    /// Open, mutate and commit an existing, fully downloaded file.
    async fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), DriveError>;

    /// Stage privately, then publish atomically. Never clobbers a file that
    /// appeared in the meantime.
    async fn create(&self, path: &Path, bytes: &[u8]) -> Result<(), DriveError>;

    async fn remove(&self, path: &Path) -> Result<(), DriveError>;

    async fn request_download(&self, path: &Path) -> Result<(), DriveError>;
}
