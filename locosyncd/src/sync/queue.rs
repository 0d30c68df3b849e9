use std::collections::{BTreeMap, HashSet, VecDeque};

use locosync_core::{FileRef, ObjectKind};

/// Files waiting for an import worker, FIFO per kind.
#[derive(Debug, Default)]
pub struct ImportQueue {
    lanes: BTreeMap<ObjectKind, VecDeque<FileRef>>,
    queued: HashSet<FileRef>,
}

impl ImportQueue {
    /// Returns false when the file is already queued.
    pub fn enqueue(&mut self, file: FileRef) -> bool {
        if !self.queued.insert(file.clone()) {
            return false;
        }
        self.lanes.entry(file.kind()).or_default().push_back(file);
        true
    }

    pub fn pop_batch(&mut self, kind: ObjectKind, max: usize) -> Vec<FileRef> {
        let Some(lane) = self.lanes.get_mut(&kind) else {
            return Vec::new();
        };
        let take = lane.len().min(max);
        let batch: Vec<FileRef> = lane.drain(..take).collect();
        for file in &batch {
            self.queued.remove(file);
        }
        batch
    }

    pub fn contains(&self, file: &FileRef) -> bool {
        self.queued.contains(file)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn len_for(&self, kind: ObjectKind) -> usize {
        self.lanes.get(&kind).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fifo_order_is_preserved_per_kind() {
        let mut queue = ImportQueue::default();
        let first = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        let second = FileRef::for_object(ObjectKind::Note, Uuid::new_v4());
        let place = FileRef::for_object(ObjectKind::Place, Uuid::new_v4());
        queue.enqueue(first.clone());
        queue.enqueue(place.clone());
        queue.enqueue(second.clone());

        assert_eq!(queue.len_for(ObjectKind::Note), 2);
        assert_eq!(queue.pop_batch(ObjectKind::Note, 1), vec![first]);
        assert_eq!(queue.pop_batch(ObjectKind::Note, 10), vec![second]);
        assert_eq!(queue.pop_batch(ObjectKind::Place, 10), vec![place]);
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_files_are_queued_once() {
        let mut queue = ImportQueue::default();
        let file = FileRef::for_week("2024-W10".parse().unwrap());
        assert!(queue.enqueue(file.clone()));
        assert!(!queue.enqueue(file.clone()));
        assert_eq!(queue.len(), 1);
        queue.pop_batch(ObjectKind::Sample, 5);
        assert!(!queue.contains(&file));
        assert!(queue.enqueue(file));
    }
}
