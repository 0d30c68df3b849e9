use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::paths::relative_to;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveEvent {
    /// Paths relative to the drive root, in on-disk form.
    Changed { paths: Vec<PathBuf> },
    /// The initial enumeration is complete.
    GatheringFinished,
}

pub fn start_drive_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<DriveEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res
            && let Some(mapped) = map_event(&watch_root, event)
        {
            let _ = tx.send(mapped);
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Option<DriveEvent> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            let paths: Vec<PathBuf> = event
                .paths
                .iter()
                .filter_map(|path| relative_to(root, path))
                .filter(|path| !is_partial(path))
                .collect();
            (!paths.is_empty()).then_some(DriveEvent::Changed { paths })
        }
        _ => None,
    }
}

fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "partial")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_modify_event_to_relative_paths() {
        let root = Path::new("/tmp/backups");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![PathBuf::from("/tmp/backups/Note/a.json")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            Some(DriveEvent::Changed {
                paths: vec![PathBuf::from("Note/a.json")]
            })
        );
    }

    #[test]
    fn rename_keeps_both_sides() {
        let root = Path::new("/tmp/backups");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![
                PathBuf::from("/tmp/backups/Place/.p.json.icloud"),
                PathBuf::from("/tmp/backups/Place/p.json"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            Some(DriveEvent::Changed {
                paths: vec![
                    PathBuf::from("Place/.p.json.icloud"),
                    PathBuf::from("Place/p.json")
                ]
            })
        );
    }

    #[test]
    fn ignores_partials_and_access_events() {
        let root = Path::new("/tmp/backups");
        let partial = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/tmp/backups/Place/p.json.partial")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(root, partial), None);

        let access = Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![PathBuf::from("/tmp/backups/Place/p.json")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(root, access), None);
    }
}
