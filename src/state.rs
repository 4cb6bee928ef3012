use std::borrow::Borrow;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{de::DeserializeOwned, Serialize};

use crate::cache::PersistentMap;
use crate::config::{LogOptions, SchedulerConfig, StateConfig};
use crate::error::Result;
use crate::executor::Executor;
use crate::log::{CompactionHandle, TransactionLog};
use crate::metrics::LogStats;
use crate::registry::Registry;
use crate::storage::{LocalStorage, Storage};
use crate::transaction::MapTransaction;
use crate::version::Version;

/// Durable key-value state.
///
/// Mutations go through the transaction log; reads go straight to the current
/// cache root and never wait on log I/O. Clones share the same state.
pub struct MapState<K, V> {
    cache: Arc<ArcSwap<PersistentMap<K, V>>>,
    log: Arc<TransactionLog<MapTransaction<K, V>>>,
    scheduler: SchedulerConfig,
}

impl<K, V> Clone for MapState<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            log: Arc::clone(&self.log),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<K, V> MapState<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens the state stored in `config.dir`, recovering it from disk.
    pub fn open(config: StateConfig) -> Result<Self> {
        let storage = LocalStorage::open(&config.dir)?;
        tracing::info!(dir = %config.dir.display(), "Opening map state");

        Ok(Self::open_with(Arc::new(storage), config.log, Registry::new())?
            .with_scheduler_config(config.scheduler))
    }

    /// Opens a state on any storage. `registry` may carry extra transaction
    /// kinds; the map kinds are added to it.
    pub fn open_with(
        storage: Arc<dyn Storage>,
        options: LogOptions,
        registry: Registry<MapTransaction<K, V>>,
    ) -> Result<Self> {
        let log = TransactionLog::new(storage, MapTransaction::extend(registry), options);
        let cache = Arc::new(ArcSwap::from_pointee(PersistentMap::new()));
        log.reset_to_latest(&cache)?;

        Ok(Self {
            cache,
            log: Arc::new(log),
            scheduler: SchedulerConfig::default(),
        })
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.load().get(key).cloned()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.load().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.load().is_empty()
    }

    /// Current cache root. It never changes, so it can be iterated while
    /// writers carry on.
    pub fn snapshot(&self) -> Arc<PersistentMap<K, V>> {
        self.cache.load_full()
    }

    /// Binds `key` to `value`, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.log
            .append_and_apply(&MapTransaction::Set { key, value }, &self.cache)
    }

    /// Unbinds `key`, returning the removed value.
    pub fn remove(&self, key: K) -> Result<Option<V>> {
        self.log
            .append_and_apply(&MapTransaction::Remove { key }, &self.cache)
    }

    /// Removes every entry. Takes a version even when already empty.
    pub fn clear(&self) -> Result<()> {
        self.log
            .append_and_apply(&MapTransaction::ClearAll, &self.cache)
            .map(|_| ())
    }

    pub fn commit(&self) -> Result<Version> {
        self.log.commit()
    }

    pub fn commit_to(&self, version: Version) -> Result<()> {
        self.log.commit_to(version)
    }

    pub fn committed_version(&self) -> Result<Version> {
        self.log.committed_version()
    }

    pub fn version(&self) -> Result<Version> {
        self.log.version()
    }

    pub fn compact(&self) -> Result<Version> {
        self.log.compact(&self.cache)
    }

    pub fn compact_async(&self) -> Result<CompactionHandle> {
        self.log.compact_async(Arc::clone(&self.cache))
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<()> {
        self.log.set_executor(executor)
    }

    pub fn stats(&self) -> Result<LogStats> {
        self.log.stats(&self.cache)
    }

    /// Releases the log. Reads keep answering from the last cache root;
    /// every log operation fails afterwards.
    pub fn close(&self) -> Result<()> {
        self.log.close()
    }

    #[cfg(test)]
    pub(crate) fn log(&self) -> &TransactionLog<MapTransaction<K, V>> {
        &self.log
    }
}

/// Opens states of one kind under a root directory, so a host can manage
/// many of them without naming their types.
pub trait StateFactory {
    type State;

    /// Opens the state kept in `root_dir`; `config.dir` is ignored.
    fn make_state(&self, config: &StateConfig, root_dir: &Path) -> Result<Self::State>;
}

/// [`StateFactory`] for [`MapState`].
pub struct MapStateFactory<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> MapStateFactory<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for MapStateFactory<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for MapStateFactory<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MapStateFactory")
    }
}

impl<K, V> StateFactory for MapStateFactory<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type State = MapState<K, V>;

    fn make_state(&self, config: &StateConfig, root_dir: &Path) -> Result<MapState<K, V>> {
        MapState::open(StateConfig {
            dir: root_dir.to_path_buf(),
            ..config.clone()
        })
    }
}
