use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use locosync_core::PLACEHOLDER_SUFFIX;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::paths::{drive_path_for, relative_to};
use super::{CloudDrive, DriveEntry, DriveError, EntryStatus};

/// A cloud-synced directory mounted on the local filesystem.
///
/// Placeholders are left in place; `request_download` only records the
/// request for the host file provider.
pub struct LocalDrive {
    root: PathBuf,
    staging_dir: PathBuf,
    download_requests: Mutex<BTreeSet<PathBuf>>,
}

impl LocalDrive {
    pub fn new(root: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging_dir: staging_dir.into(),
            download_requests: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn pending_downloads(&self) -> Vec<PathBuf> {
        self.download_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn absolute(&self, path: &Path) -> Result<PathBuf, DriveError> {
        Ok(drive_path_for(&self.root, path)?)
    }

    fn placeholder_for(&self, path: &Path) -> Result<PathBuf, DriveError> {
        let target = self.absolute(path)?;
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(target.with_file_name(format!(".{name}{PLACEHOLDER_SUFFIX}")))
    }

    fn forget_request(&self, path: &Path) {
        self.download_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }
}

#[async_trait]
impl CloudDrive for LocalDrive {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn list(&self, dir: &Path) -> Result<Vec<DriveEntry>, DriveError> {
        let start = if dir.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.absolute(dir)?
        };
        let mut entries = Vec::new();
        let mut pending = vec![start];
        while let Some(current) = pending.pop() {
            let mut read_dir = match tokio::fs::read_dir(&current).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if !name.starts_with('.') {
                        pending.push(entry.path());
                    }
                    continue;
                }
                if name.starts_with('.') && !name.ends_with(PLACEHOLDER_SUFFIX) {
                    continue;
                }
                let Some(path) = relative_to(&self.root, &entry.path()) else {
                    continue;
                };
                let modified = entry.metadata().await?.modified().ok();
                entries.push(DriveEntry { path, modified });
            }
        }
        entries.sort_by(|left, right| left.path.cmp(&right.path));
        Ok(entries)
    }

    async fn status(&self, path: &Path) -> Result<EntryStatus, DriveError> {
        if tokio::fs::try_exists(self.absolute(path)?).await? {
            return Ok(EntryStatus::Present);
        }
        if tokio::fs::try_exists(self.placeholder_for(path)?).await? {
            return Ok(EntryStatus::Placeholder);
        }
        Ok(EntryStatus::Missing)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, DriveError> {
        match tokio::fs::read(self.absolute(path)?).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                match self.status(path).await? {
                    EntryStatus::Placeholder => Err(DriveError::DownloadPending(path.to_path_buf())),
                    _ => Err(DriveError::NotFound(path.to_path_buf())),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn replace(&self, path: &Path, bytes: &[u8]) -> Result<(), DriveError> {
        match self.status(path).await? {
            EntryStatus::Present => {}
            EntryStatus::Placeholder => return Err(DriveError::DownloadPending(path.to_path_buf())),
            EntryStatus::Missing => return Err(DriveError::NotFound(path.to_path_buf())),
        }
        let target = self.absolute(path)?;
        let partial = partial_path(&target);
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, &target).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "replaced drive file");
        Ok(())
    }

    async fn create(&self, path: &Path, bytes: &[u8]) -> Result<(), DriveError> {
        let target = self.absolute(path)?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staging_dir.join(Uuid::new_v4().simple().to_string());
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let published = publish(&staged, &target).await;
        let _ = tokio::fs::remove_file(&staged).await;
        match published {
            Ok(()) => {
                debug!(path = %path.display(), bytes = bytes.len(), "published drive file");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(DriveError::AlreadyExists(path.to_path_buf()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn remove(&self, path: &Path) -> Result<(), DriveError> {
        match tokio::fs::remove_file(self.absolute(path)?).await {
            Ok(()) => {
                self.forget_request(path);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(DriveError::NotFound(path.to_path_buf()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn request_download(&self, path: &Path) -> Result<(), DriveError> {
        let inserted = self
            .download_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf());
        if inserted {
            info!(path = %path.display(), "requested download of placeholder");
        }
        Ok(())
    }
}

/// Links `staged` into place without replacing an existing target. A
/// staging dir on another filesystem goes through a sibling copy first.
async fn publish(staged: &Path, target: &Path) -> std::io::Result<()> {
    match tokio::fs::hard_link(staged, target).await {
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            let sibling = partial_path(target);
            tokio::fs::copy(staged, &sibling).await?;
            let linked = tokio::fs::hard_link(&sibling, target).await;
            let _ = tokio::fs::remove_file(&sibling).await;
            linked
        }
        other => other,
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    target.with_file_name(name)
}
