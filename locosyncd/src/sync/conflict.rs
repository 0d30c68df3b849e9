use locosync_core::{Syncable, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No local copy: insert with a fresh save stamp.
    Insert,
    /// Local copy is as new or newer.
    Existing,
    /// Incoming copy supersedes the local one.
    Replace,
    /// Incoming copy carries no comparable stamp.
    Reject,
}

pub fn decide<T: Syncable + ?Sized>(local: Option<&T>, incoming: &T) -> MergeDecision {
    let Some(local) = local else {
        return MergeDecision::Insert;
    };
    decide_stamps(local.last_saved(), incoming.last_saved())
}

fn decide_stamps(local: Option<Timestamp>, incoming: Option<Timestamp>) -> MergeDecision {
    match (local, incoming) {
        (_, None) => MergeDecision::Reject,
        (None, Some(_)) => MergeDecision::Replace,
        (Some(local), Some(incoming)) if incoming <= local => MergeDecision::Existing,
        (Some(_), Some(_)) => MergeDecision::Replace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locosync_core::{Note, SyncStamp};
    use time::macros::datetime;
    use uuid::Uuid;

    fn note(last_saved: Option<Timestamp>) -> Note {
        Note {
            id: Uuid::nil(),
            date: datetime!(2024-03-01 10:00 UTC),
            body: "n".into(),
            stamp: SyncStamp {
                last_saved,
                backup_synced_at: None,
            },
        }
    }

    #[test]
    fn inserts_when_no_local_copy() {
        let incoming = note(Some(datetime!(2024-03-01 10:00 UTC)));
        assert_eq!(decide(None, &incoming), MergeDecision::Insert);
        assert_eq!(decide(None, &note(None)), MergeDecision::Insert);
    }

    #[test]
    fn rejects_incoming_without_stamp() {
        let local = note(Some(datetime!(2024-03-01 10:00 UTC)));
        assert_eq!(decide(Some(&local), &note(None)), MergeDecision::Reject);
    }

    #[test]
    fn equal_or_older_keeps_existing() {
        let local = note(Some(datetime!(2024-03-01 10:00 UTC)));
        let equal = note(Some(datetime!(2024-03-01 10:00 UTC)));
        let older = note(Some(datetime!(2024-03-01 09:00 UTC)));
        assert_eq!(decide(Some(&local), &equal), MergeDecision::Existing);
        assert_eq!(decide(Some(&local), &older), MergeDecision::Existing);
    }

    #[test]
    fn newer_replaces() {
        let local = note(Some(datetime!(2024-03-01 10:00 UTC)));
        let newer = note(Some(datetime!(2024-03-01 10:00:01 UTC)));
        assert_eq!(decide(Some(&local), &newer), MergeDecision::Replace);
    }
}
