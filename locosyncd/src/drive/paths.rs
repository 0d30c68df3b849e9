use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("drive path is empty")]
    Empty,
    #[error("drive path contains unsupported component")]
    UnsupportedComponent,
}

pub fn drive_path_for(root: &Path, relative: &Path) -> Result<PathBuf, PathError> {
    if relative.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`drive_path_for`]; `None` for paths outside `root`.
pub fn relative_to(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_path_under_root() {
        let root = PathBuf::from("/backups");
        let mapped = drive_path_for(&root, Path::new("Place/a.json")).unwrap();
        assert_eq!(mapped, PathBuf::from("/backups/Place/a.json"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/backups");
        assert!(matches!(
            drive_path_for(&root, Path::new("../secret")),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            drive_path_for(&root, Path::new("")),
            Err(PathError::Empty)
        ));
    }

    #[test]
    fn strips_root() {
        let root = PathBuf::from("/backups");
        assert_eq!(
            relative_to(&root, Path::new("/backups/Note/b.json")),
            Some(PathBuf::from("Note/b.json"))
        );
        assert_eq!(relative_to(&root, Path::new("/elsewhere/b.json")), None);
        assert_eq!(relative_to(&root, Path::new("/backups")), None);
    }
}
