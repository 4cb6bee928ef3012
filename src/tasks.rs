use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;
use crate::metrics::{collect_metrics, LogStats};
use crate::scheduler::{BackgroundTask, Context};
use crate::state::MapState;
use crate::Error;

/// Decides when a state is worth compacting. There is no built-in default;
/// any `Fn(&LogStats) -> bool` works.
pub trait CompactionPolicy: Send + Sync {
    fn should_compact(&self, stats: &LogStats) -> bool;
}

impl<F> CompactionPolicy for F
where
    F: Fn(&LogStats) -> bool + Send + Sync,
{
    fn should_compact(&self, stats: &LogStats) -> bool {
        self(stats)
    }
}

pub struct CompactionTask<K, V> {
    state: MapState<K, V>,
    policy: Arc<dyn CompactionPolicy>,
}

impl<K, V> CompactionTask<K, V> {
    pub fn new(state: MapState<K, V>, policy: Arc<dyn CompactionPolicy>) -> Self {
        Self { state, policy }
    }
}

#[async_trait::async_trait]
impl<K, V> BackgroundTask for CompactionTask<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.state.scheduler_config().compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let stats = self.state.stats()?;
        if !self.policy.should_compact(&stats) {
            return Ok(());
        }

        let state = self.state.clone();
        tokio::task::spawn_blocking(move || state.compact())
            .await
            .map_err(|e| Error::InvalidState(format!("compaction panicked: {}", e)))??;
        Ok(())
    }
}

pub struct MetricsTask<K, V> {
    state: MapState<K, V>,
}

impl<K, V> MetricsTask<K, V> {
    pub fn new(state: MapState<K, V>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl<K, V> BackgroundTask for MetricsTask<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.state.scheduler_config().metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        collect_metrics(&self.state.stats()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogOptions, SchedulerConfig};
    use crate::log::snapshot::snapshot_name;
    use crate::registry::Registry;
    use crate::scheduler::Scheduler;
    use crate::storage::{MemoryStorage, Storage};
    use crate::version::Version;

    fn open(storage: &Arc<MemoryStorage>) -> MapState<String, u64> {
        MapState::open_with(storage.clone(), LogOptions::default(), Registry::new())
            .unwrap()
            .with_scheduler_config(
                SchedulerConfig::default()
                    .compaction_interval(Duration::from_millis(10))
                    .metrics_interval(Duration::from_millis(10)),
            )
    }

    #[test]
    fn test_closure_is_a_policy() {
        let policy = |stats: &LogStats| stats.entries_since_snapshot() >= 3;
        let mut stats = LogStats {
            version: Version::new(2),
            committed_version: Version::ZERO,
            snapshot_version: Version::ZERO,
            active_segment_bytes: 0,
            cache_entries: 0,
        };
        assert!(!policy.should_compact(&stats));
        stats.version = Version::new(3);
        assert!(policy.should_compact(&stats));
    }

    #[tokio::test]
    async fn test_compaction_task_follows_policy() -> Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        let state = open(&storage);
        for i in 0..4u64 {
            state.put(format!("k{}", i), i)?;
        }

        let never = CompactionTask::new(state.clone(), Arc::new(|_: &LogStats| false));
        never.execute(test_context()).await?;
        assert_eq!(state.stats()?.snapshot_version, Version::ZERO);

        let task = CompactionTask::new(
            state.clone(),
            Arc::new(|stats: &LogStats| stats.entries_since_snapshot() >= 4),
        );
        task.execute(test_context()).await?;
        assert_eq!(state.stats()?.snapshot_version, Version::new(4));
        assert!(storage.list()?.contains(&snapshot_name(Version::new(4))));

        // Nothing new since the snapshot, so the policy declines.
        task.execute(test_context()).await?;
        assert_eq!(state.stats()?.snapshot_version, Version::new(4));
        Ok(())
    }

    #[tokio::test]
    async fn test_tasks_run_under_scheduler() -> Result<()> {
        let storage = Arc::new(MemoryStorage::new());
        let state = open(&storage);
        state.put("a".to_string(), 1)?;

        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(CompactionTask::new(
                state.clone(),
                Arc::new(|stats: &LogStats| stats.entries_since_snapshot() > 0),
            )))?
            .register(Arc::new(MetricsTask::new(state.clone())))?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await?;

        assert_eq!(state.stats()?.snapshot_version, Version::new(1));
        Ok(())
    }

    fn test_context() -> Context {
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        drop(tx);
        Context {
            task_name: "test",
            run_id: 1,
            shutdown: rx,
        }
    }
}
