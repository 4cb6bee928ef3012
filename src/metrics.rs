use crate::error::Result;
use crate::version::Version;

/// Point-in-time view of a state's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub version: Version,
    pub committed_version: Version,
    pub snapshot_version: Version,
    pub active_segment_bytes: u64,
    pub cache_entries: usize,
}

impl LogStats {
    /// Log entries a reopen would replay on top of the latest snapshot.
    pub fn entries_since_snapshot(&self) -> u128 {
        self.version.distance_from(self.snapshot_version)
    }

    /// Entries appended but not yet covered by a commit.
    pub fn uncommitted_entries(&self) -> u128 {
        self.version.distance_from(self.committed_version)
    }
}

/// Log state metrics as a structured event
pub fn collect_metrics(stats: &LogStats) -> Result<()> {
    tracing::info!(
        version = %stats.version,
        committed_version = %stats.committed_version,
        snapshot_version = %stats.snapshot_version,
        entries_since_snapshot = %stats.entries_since_snapshot(),
        active_segment_bytes = stats.active_segment_bytes,
        cache_entries = stats.cache_entries,
        "State metrics"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_counts() {
        let stats = LogStats {
            version: Version::new(12),
            committed_version: Version::new(10),
            snapshot_version: Version::new(4),
            active_segment_bytes: 1024,
            cache_entries: 3,
        };
        assert_eq!(stats.entries_since_snapshot(), 8);
        assert_eq!(stats.uncommitted_entries(), 2);
        assert!(collect_metrics(&stats).is_ok());
    }
}
