//! Transactions: serializable commands that move the cache from one version
//! to the next.
//!
//! The log manager never looks inside a transaction. It only needs the kind
//! tag and payload (to write the log) and `apply` (to update the cache), so new
//! kinds plug in through [`Registry`](crate::registry::Registry) without
//! touching the log.

use std::hash::Hash;

use serde::{de::DeserializeOwned, Serialize};

use crate::cache::PersistentMap;
use crate::encoding::bincode;
use crate::error::Result;
use crate::registry::Registry;

/// Cache types the log can persist as a snapshot and rebuild from one.
pub trait Snapshot: Default + Send + Sync + 'static {
    fn encode_snapshot(&self) -> Result<Vec<u8>>;

    fn decode_snapshot(bytes: &[u8]) -> Result<Self>
    where
        Self: Sized;

    fn entry_count(&self) -> usize;
}

pub trait Transaction: Send + Sync + 'static {
    type Cache: Snapshot;
    type Output;

    /// Tag written in front of the payload. Must be registered.
    fn kind(&self) -> u8;

    fn encode_payload(&self) -> Result<Vec<u8>>;

    /// Pure: the result depends only on `self` and `cache`.
    fn apply(&self, cache: &Self::Cache) -> (Self::Cache, Self::Output);
}

/// Mutations of a [`PersistentMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapTransaction<K, V> {
    Set { key: K, value: V },
    Remove { key: K },
    ClearAll,
}

impl<K, V> MapTransaction<K, V> {
    pub const SET: u8 = 0x01;
    pub const REMOVE: u8 = 0x02;
    pub const CLEAR_ALL: u8 = 0x03;
}

impl<K, V> MapTransaction<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Registry holding only the map kinds.
    pub fn registry() -> Registry<Self> {
        Self::extend(Registry::new())
    }

    /// Adds the map kinds to `base`.
    pub fn extend(base: Registry<Self>) -> Registry<Self> {
        base.register(Self::SET, "set", decode_set::<K, V>)
            .register(Self::REMOVE, "remove", decode_remove::<K, V>)
            .register(Self::CLEAR_ALL, "clear-all", decode_clear::<K, V>)
    }
}

fn decode_set<K: DeserializeOwned, V: DeserializeOwned>(bytes: &[u8]) -> Result<MapTransaction<K, V>> {
    let (key, value) = bincode::deserialize("set payload", bytes)?;
    Ok(MapTransaction::Set { key, value })
}

fn decode_remove<K: DeserializeOwned, V>(bytes: &[u8]) -> Result<MapTransaction<K, V>> {
    let key = bincode::deserialize("remove payload", bytes)?;
    Ok(MapTransaction::Remove { key })
}

fn decode_clear<K, V>(bytes: &[u8]) -> Result<MapTransaction<K, V>> {
    if !bytes.is_empty() {
        return Err(crate::Error::Decode(
            "clear-all payload",
            format!("expected no payload, found {} bytes", bytes.len()),
        ));
    }
    Ok(MapTransaction::ClearAll)
}

impl<K, V> Transaction for MapTransaction<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Cache = PersistentMap<K, V>;
    type Output = Option<V>;

    fn kind(&self) -> u8 {
        match self {
            MapTransaction::Set { .. } => Self::SET,
            MapTransaction::Remove { .. } => Self::REMOVE,
            MapTransaction::ClearAll => Self::CLEAR_ALL,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            MapTransaction::Set { key, value } => bincode::serialize("set payload", &(key, value)),
            MapTransaction::Remove { key } => bincode::serialize("remove payload", key),
            MapTransaction::ClearAll => Ok(Vec::new()),
        }
    }

    fn apply(&self, cache: &Self::Cache) -> (Self::Cache, Self::Output) {
        match self {
            MapTransaction::Set { key, value } => {
                let prior = cache.get(key).cloned();
                (cache.with(key.clone(), value.clone()), prior)
            }
            MapTransaction::Remove { key } => {
                let prior = cache.get(key).cloned();
                (cache.without(key), prior)
            }
            MapTransaction::ClearAll => (PersistentMap::new(), None),
        }
    }
}

impl<K, V> Snapshot for PersistentMap<K, V>
where
    K: Hash + Eq + Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode_snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize("snapshot", self)
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize("snapshot", bytes)
    }

    fn entry_count(&self) -> usize {
        self.len()
    }
}
