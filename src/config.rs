use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a map state
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Directory holding the log segments and snapshots
    pub dir: PathBuf,

    /// Transaction log settings
    pub log: LogOptions,

    /// Background task intervals
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Size past which the active segment is rolled (default: 64MB)
    pub segment_size: u64,

    /// Sync the segment after every append (default: false)
    ///
    /// When off, appends survive a process crash and `commit` makes them
    /// survive a machine crash.
    pub sync_on_append: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the compaction policy is consulted (default: 10s)
    pub compaction_interval: Duration,

    /// How often log metrics are emitted (default: 30s)
    pub metrics_interval: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024, // 64MB
            sync_on_append: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            compaction_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ashstate"),
            log: LogOptions::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl StateConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Configure log settings
    pub fn log(mut self, options: LogOptions) -> Self {
        self.log = options;
        self
    }

    /// Configure background task intervals
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl LogOptions {
    /// Set the segment roll size
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sync after every append
    pub fn sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }
}

impl SchedulerConfig {
    /// Set compaction check interval
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StateConfig::default();
        assert_eq!(config.dir, PathBuf::from("./ashstate"));
        assert_eq!(config.log.segment_size, 64 * 1024 * 1024);
        assert!(!config.log.sync_on_append);
        assert_eq!(config.scheduler.compaction_interval, Duration::from_secs(10));
        assert_eq!(config.scheduler.metrics_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = StateConfig::new("/tmp/state")
            .log(LogOptions::default().segment_size(4096).sync_on_append(true))
            .scheduler(
                SchedulerConfig::default()
                    .compaction_interval(Duration::from_millis(500))
                    .metrics_interval(Duration::from_secs(5)),
            );

        assert_eq!(config.dir, PathBuf::from("/tmp/state"));
        assert_eq!(config.log.segment_size, 4096);
        assert!(config.log.sync_on_append);
        assert_eq!(config.scheduler.compaction_interval, Duration::from_millis(500));
        assert_eq!(config.scheduler.metrics_interval, Duration::from_secs(5));
    }
}
