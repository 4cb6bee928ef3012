use itertools::Itertools;

use super::segment::parse_segment_name;
use super::snapshot::parse_snapshot_name;
use crate::storage::Storage;
use crate::version::Version;

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct CleanupReport {
    pub deleted: Vec<String>,
    /// Objects that should have been deleted but are still there.
    pub orphaned: Vec<String>,
}

/// Names made redundant by a durable snapshot at `snapshot`: older snapshots,
/// and segments whose base is at or below it. Segments are rolled at the
/// snapshot point, so such segments hold nothing newer than `snapshot`.
pub(crate) fn obsolete_objects(names: &[String], snapshot: Version) -> Vec<String> {
    names
        .iter()
        .filter(|name| {
            parse_snapshot_name(name).map_or(false, |v| v < snapshot)
                || parse_segment_name(name).map_or(false, |base| base <= snapshot)
        })
        .sorted()
        .cloned()
        .collect()
}

/// Deletes everything the snapshot at `snapshot` supersedes.
///
/// Never fails: anything that cannot be removed now is logged and picked up
/// again by the next compaction, which recomputes the set from a listing.
pub(crate) fn cleanup(storage: &dyn Storage, snapshot: Version) -> CleanupReport {
    let names = match storage.list() {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(
                snapshot = %snapshot,
                error = %e,
                "Failed to list objects for cleanup"
            );
            return CleanupReport::default();
        }
    };

    let obsolete = obsolete_objects(&names, snapshot);
    if obsolete.is_empty() {
        return CleanupReport::default();
    }

    tracing::debug!(
        snapshot = %snapshot,
        obsolete = ?obsolete,
        "Found {} objects to clean up",
        obsolete.len()
    );

    let mut report = CleanupReport::default();
    for name in obsolete {
        match storage.delete(&name) {
            Ok(()) => {
                tracing::info!(object = %name, "Deleted superseded object");
                report.deleted.push(name);
            }
            Err(e) => {
                tracing::warn!(
                    object = %name,
                    error = %e,
                    "Failed to delete superseded object, leaving it for the next compaction"
                );
                report.orphaned.push(name);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::segment::segment_name;
    use crate::log::snapshot::snapshot_name;
    use crate::storage::MemoryStorage;

    fn v(n: u128) -> Version {
        Version::new(n)
    }

    #[test]
    fn test_obsolete_objects() {
        let names = vec![
            segment_name(v(1)),
            segment_name(v(4)),
            segment_name(v(6)),
            snapshot_name(v(3)),
            snapshot_name(v(5)),
            "LOCK".to_string(),
            "notes.txt".to_string(),
        ];

        let obsolete = obsolete_objects(&names, v(5));
        let mut expected = vec![segment_name(v(1)), segment_name(v(4)), snapshot_name(v(3))];
        expected.sort();
        assert_eq!(obsolete, expected);
    }

    #[test]
    fn test_cleanup_keeps_snapshot_and_newer_segments() {
        let storage = MemoryStorage::new();
        for name in [
            segment_name(v(1)),
            segment_name(v(3)),
            segment_name(v(4)),
            snapshot_name(v(2)),
            snapshot_name(v(3)),
        ] {
            storage.put(&name, b"x").unwrap();
        }

        let report = cleanup(&storage, v(3));
        assert_eq!(report.deleted.len(), 3);
        assert!(report.orphaned.is_empty());

        let mut left = storage.list().unwrap();
        left.sort();
        let mut expected = vec![segment_name(v(4)), snapshot_name(v(3))];
        expected.sort();
        assert_eq!(left, expected);
    }

    #[test]
    fn test_failed_delete_is_reported_not_raised() {
        let storage = MemoryStorage::new();
        storage.put(&segment_name(v(1)), b"x").unwrap();
        storage.put(&snapshot_name(v(1)), b"x").unwrap();
        storage.put(&snapshot_name(v(2)), b"x").unwrap();
        storage.fail_next_delete();

        let report = cleanup(&storage, v(2));
        assert_eq!(report.deleted.len() + report.orphaned.len(), 2);
        assert_eq!(report.orphaned.len(), 1);

        let retry = cleanup(&storage, v(2));
        assert_eq!(retry.deleted, report.orphaned);
        assert_eq!(storage.list().unwrap(), vec![snapshot_name(v(2))]);
    }
}
