use std::fmt;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::model::ObjectKind;
use crate::week::IsoWeek;

/// Files not yet downloaded by the file provider show up as `.<name>.icloud`.
pub const PLACEHOLDER_SUFFIX: &str = ".icloud";

const OBJECT_EXTENSION: &str = ".json";
const BATCH_EXTENSION: &str = ".json.gz";
const ITEM_SHARD_LEN: usize = 2;

/// Normalized identity of a backup file, independent of its download state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileRef {
    kind: ObjectKind,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub file: FileRef,
    pub placeholder: bool,
}

impl FileRef {
    pub fn for_object(kind: ObjectKind, id: Uuid) -> Self {
        Self {
            kind,
            name: format!("{}{OBJECT_EXTENSION}", id.as_hyphenated()),
        }
    }

    pub fn for_week(week: IsoWeek) -> Self {
        Self {
            kind: ObjectKind::Sample,
            name: format!("{week}{BATCH_EXTENSION}"),
        }
    }

    /// Only the canonical spelling is accepted: lowercase hyphenated ids and
    /// zero-padded weeks.
    pub fn from_name(kind: ObjectKind, name: &str) -> Option<Self> {
        let file = match kind {
            ObjectKind::Sample => Self::for_week(name.strip_suffix(BATCH_EXTENSION)?.parse().ok()?),
            _ => {
                let stem = name.strip_suffix(OBJECT_EXTENSION)?;
                Self::for_object(kind, Uuid::parse_str(stem).ok()?)
            }
        };
        (file.name == name).then_some(file)
    }

    /// Accepts `<KindDir>/[<shard>/]<name>` with the name optionally in
    /// placeholder form. The shard directory must be the one the name maps to.
    pub fn parse_path(path: &Path) -> Option<ParsedPath> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                Component::CurDir => continue,
                _ => return None,
            }
        }
        let (last, dirs) = parts.split_last()?;
        let kind = ObjectKind::from_dir_name(dirs.first()?)?;
        let (name, placeholder) = match placeholder_target(last) {
            Some(name) => (name, true),
            None => (*last, false),
        };
        let file = Self::from_name(kind, name)?;
        if file.directory() != dirs.iter().collect::<PathBuf>() {
            return None;
        }
        Some(ParsedPath { file, placeholder })
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> Option<Uuid> {
        if self.kind == ObjectKind::Sample {
            return None;
        }
        let stem = self.name.strip_suffix(OBJECT_EXTENSION)?;
        Uuid::parse_str(stem).ok()
    }

    pub fn week(&self) -> Option<IsoWeek> {
        if self.kind != ObjectKind::Sample {
            return None;
        }
        self.name.strip_suffix(BATCH_EXTENSION)?.parse().ok()
    }

    pub fn relative_path(&self) -> PathBuf {
        self.directory().join(&self.name)
    }

    pub fn placeholder_path(&self) -> PathBuf {
        self.directory()
            .join(format!(".{}{PLACEHOLDER_SUFFIX}", self.name))
    }

    fn directory(&self) -> PathBuf {
        let base = PathBuf::from(self.kind.dir_name());
        match self.shard() {
            Some(shard) => base.join(shard),
            None => base,
        }
    }

    // Keeps directory fan-out bounded for the large collections.
    fn shard(&self) -> Option<String> {
        match self.kind {
            ObjectKind::TimelineItem => Some(self.name.chars().take(ITEM_SHARD_LEN).collect()),
            ObjectKind::Sample => self.week().map(|week| week.year().to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.dir_name(), self.name)
    }
}

fn placeholder_target(name: &str) -> Option<&str> {
    name.strip_prefix('.')?
        .strip_suffix(PLACEHOLDER_SUFFIX)
        .filter(|inner| !inner.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_items_are_sharded_by_id_prefix() {
        let id = Uuid::parse_str("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap();
        let file = FileRef::for_object(ObjectKind::TimelineItem, id);
        assert_eq!(
            file.relative_path(),
            PathBuf::from("TimelineItem/3f/3fa85f64-5717-4562-b3fc-2c963f66afa6.json")
        );
        assert_eq!(
            file.placeholder_path(),
            PathBuf::from("TimelineItem/3f/.3fa85f64-5717-4562-b3fc-2c963f66afa6.json.icloud")
        );
        assert_eq!(file.object_id(), Some(id));
    }

    #[test]
    fn places_are_flat() {
        let id = Uuid::parse_str("3fa85f64-5717-4562-b3fc-2c963f66afa6").unwrap();
        let file = FileRef::for_object(ObjectKind::Place, id);
        assert_eq!(
            file.relative_path(),
            PathBuf::from("Place/3fa85f64-5717-4562-b3fc-2c963f66afa6.json")
        );
    }

    #[test]
    fn sample_weeks_are_grouped_by_year() {
        let file = FileRef::for_week("2024-W03".parse().unwrap());
        assert_eq!(
            file.relative_path(),
            PathBuf::from("LocomotionSample/2024/2024-W03.json.gz")
        );
        assert_eq!(file.object_id(), None);
        assert_eq!(file.week().map(|w| w.to_string()).as_deref(), Some("2024-W03"));
    }

    #[test]
    fn parses_placeholder_and_data_paths_to_same_file() {
        let data = FileRef::parse_path(Path::new("LocomotionSample/2024/2024-W03.json.gz")).unwrap();
        let placeholder =
            FileRef::parse_path(Path::new("LocomotionSample/2024/.2024-W03.json.gz.icloud")).unwrap();
        assert!(!data.placeholder);
        assert!(placeholder.placeholder);
        assert_eq!(data.file, placeholder.file);
    }

    #[test]
    fn ignores_unrelated_files() {
        assert!(FileRef::parse_path(Path::new("Place/notes.txt")).is_none());
        assert!(FileRef::parse_path(Path::new("Place/x.json.partial")).is_none());
        assert!(FileRef::parse_path(Path::new("Unknown/abc.json")).is_none());
        assert!(FileRef::parse_path(Path::new("Place")).is_none());
        assert!(FileRef::parse_path(Path::new("../Place/a.json")).is_none());
        assert!(FileRef::parse_path(Path::new("Place/.icloud")).is_none());
    }

    #[test]
    fn rejects_non_canonical_spellings() {
        let id = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        assert!(FileRef::from_name(ObjectKind::Place, &format!("{id}.json")).is_some());
        let upper = id.to_uppercase();
        assert!(FileRef::from_name(ObjectKind::Place, &format!("{upper}.json")).is_none());
        let simple = id.replace('-', "");
        assert!(FileRef::from_name(ObjectKind::Place, &format!("{simple}.json")).is_none());
        assert!(FileRef::from_name(ObjectKind::Sample, "2024-W3.json.gz").is_none());
    }

    #[test]
    fn rejects_files_in_the_wrong_directory() {
        let id = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        assert!(FileRef::parse_path(Path::new(&format!("TimelineItem/3f/{id}.json"))).is_some());
        assert!(FileRef::parse_path(Path::new(&format!("TimelineItem/{id}.json"))).is_none());
        assert!(FileRef::parse_path(Path::new(&format!("TimelineItem/ab/{id}.json"))).is_none());
        assert!(FileRef::parse_path(Path::new(&format!("Place/3f/{id}.json"))).is_none());
        assert!(FileRef::parse_path(Path::new("LocomotionSample/2023/2024-W03.json.gz")).is_none());
        assert!(FileRef::parse_path(Path::new("LocomotionSample/2024-W03.json.gz")).is_none());
    }
}
