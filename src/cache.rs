//! Persistent hash map used as the in-memory projection of the log.
//!
//! The map is a hash-array-mapped trie. Every update copies only the path from
//! the root to the touched slot and shares everything else with the previous
//! version, so an old root stays valid and readable while a writer builds the
//! next one. That is what lets readers hold a root without taking any lock.
//!
//! # Layout
//!
//! ```text
//!              Branch (bitmap: 32 bits, one slot per set bit)
//!             /        |                \
//!         Leaf      Branch           Collision
//!                  /      \          (full 64-bit hash equal)
//!               Leaf      Leaf
//! ```
//!
//! - Each level consumes 5 bits of the key hash, so lookups touch at most 13 nodes.
//! - Slots are packed: the position of a slot is the popcount of the bitmap
//!   below its bit.
//! - Keys whose full hashes collide live in a `Collision` node.
//! - Removing a key collapses single-leaf branches back into their parent, so
//!   the shape depends only on the set of keys.
//!
//! Iteration order follows hash order and carries no meaning.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const BITS: u32 = 5;
const MASK: u64 = (1 << BITS) - 1;

fn hash_of<Q: Hash + ?Sized>(key: &Q) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn fragment(hash: u64, shift: u32) -> u32 {
    ((hash >> shift) & MASK) as u32
}

fn slot(bitmap: u32, bit: u32) -> usize {
    (bitmap & (bit - 1)).count_ones() as usize
}

enum Entry<K, V> {
    Leaf(u64, Arc<(K, V)>),
    Node(Arc<Node<K, V>>),
}

impl<K, V> Clone for Entry<K, V> {
    fn clone(&self) -> Self {
        match self {
            Entry::Leaf(hash, kv) => Entry::Leaf(*hash, Arc::clone(kv)),
            Entry::Node(node) => Entry::Node(Arc::clone(node)),
        }
    }
}

impl<K, V> Entry<K, V> {
    fn hash(&self) -> u64 {
        match self {
            Entry::Leaf(hash, _) => *hash,
            Entry::Node(node) => match node.as_ref() {
                Node::Collision { hash, .. } => *hash,
                // Only leaves and collision nodes are ever merged.
                Node::Branch { .. } => unreachable!("branch entries carry no single hash"),
            },
        }
    }

    fn is_leaf(&self) -> bool {
        matches!(self, Entry::Leaf(..))
    }
}

enum Node<K, V> {
    Branch { bitmap: u32, entries: Vec<Entry<K, V>> },
    Collision { hash: u64, entries: Vec<Entry<K, V>> },
}

impl<K, V> Node<K, V> {
    fn entries(&self) -> &[Entry<K, V>] {
        match self {
            Node::Branch { entries, .. } | Node::Collision { entries, .. } => entries,
        }
    }
}

/// Builds the smallest subtree at `shift` holding two entries that landed in
/// the same slot.
fn merge<K, V>(shift: u32, first: Entry<K, V>, second: Entry<K, V>) -> Node<K, V> {
    let (h1, h2) = (first.hash(), second.hash());
    if h1 == h2 {
        return Node::Collision {
            hash: h1,
            entries: vec![first, second],
        };
    }

    let (f1, f2) = (fragment(h1, shift), fragment(h2, shift));
    if f1 == f2 {
        let child = merge(shift + BITS, first, second);
        return Node::Branch {
            bitmap: 1 << f1,
            entries: vec![Entry::Node(Arc::new(child))],
        };
    }

    let entries = if f1 < f2 {
        vec![first, second]
    } else {
        vec![second, first]
    };
    Node::Branch {
        bitmap: (1 << f1) | (1 << f2),
        entries,
    }
}

fn leaf_matches<K, V, Q>(entry: &Entry<K, V>, hash: u64, key: &Q) -> bool
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    match entry {
        Entry::Leaf(h, kv) => *h == hash && kv.0.borrow() == key,
        Entry::Node(_) => false,
    }
}

/// Returns the new node and whether a key was added (as opposed to replaced).
fn insert<K: Eq, V>(
    node: &Arc<Node<K, V>>,
    shift: u32,
    hash: u64,
    leaf: Entry<K, V>,
) -> (Arc<Node<K, V>>, bool) {
    match node.as_ref() {
        Node::Branch { bitmap, entries } => {
            let bit = 1 << fragment(hash, shift);
            let pos = slot(*bitmap, bit);
            let mut entries = entries.clone();

            if bitmap & bit == 0 {
                entries.insert(pos, leaf);
                let branch = Node::Branch {
                    bitmap: bitmap | bit,
                    entries,
                };
                return (Arc::new(branch), true);
            }

            let (replacement, added) = match &entries[pos] {
                Entry::Leaf(h, kv) => {
                    let same_key = match &leaf {
                        Entry::Leaf(_, new) => *h == hash && kv.0 == new.0,
                        Entry::Node(_) => false,
                    };
                    if same_key {
                        (leaf, false)
                    } else {
                        let merged = merge(shift + BITS, entries[pos].clone(), leaf);
                        (Entry::Node(Arc::new(merged)), true)
                    }
                }
                Entry::Node(child) => {
                    let (child, added) = insert(child, shift + BITS, hash, leaf);
                    (Entry::Node(child), added)
                }
            };
            entries[pos] = replacement;

            let branch = Node::Branch {
                bitmap: *bitmap,
                entries,
            };
            (Arc::new(branch), added)
        }
        Node::Collision {
            hash: shared,
            entries,
        } => {
            if *shared != hash {
                let split = merge(shift, Entry::Node(Arc::clone(node)), leaf);
                return (Arc::new(split), true);
            }

            let mut entries = entries.clone();
            let existing = match &leaf {
                Entry::Leaf(_, new) => entries.iter().position(|e| leaf_matches(e, hash, &new.0)),
                Entry::Node(_) => None,
            };
            let added = match existing {
                Some(pos) => {
                    entries[pos] = leaf;
                    false
                }
                None => {
                    entries.push(leaf);
                    true
                }
            };
            (Arc::new(Node::Collision { hash, entries }), added)
        }
    }
}

/// Removal outcome for one node.
///
/// `None` means the key was absent and nothing changed. `Some(None)` means the
/// node emptied out. `Some(Some(entry))` is what now occupies the node's slot,
/// which may be a lone leaf pulled up from below.
type Removal<K, V> = Option<Option<Entry<K, V>>>;

fn remove<K, V, Q>(node: &Arc<Node<K, V>>, shift: u32, hash: u64, key: &Q) -> Removal<K, V>
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    match node.as_ref() {
        Node::Branch { bitmap, entries } => {
            let bit = 1 << fragment(hash, shift);
            if bitmap & bit == 0 {
                return None;
            }
            let pos = slot(*bitmap, bit);

            let replacement = match &entries[pos] {
                Entry::Leaf(..) if leaf_matches(&entries[pos], hash, key) => None,
                Entry::Leaf(..) => return None,
                Entry::Node(child) => remove(child, shift + BITS, hash, key)?,
            };

            match replacement {
                Some(entry) => {
                    if entry.is_leaf() && entries.len() == 1 && shift > 0 {
                        return Some(Some(entry));
                    }
                    let mut entries = entries.clone();
                    entries[pos] = entry;
                    let branch = Node::Branch {
                        bitmap: *bitmap,
                        entries,
                    };
                    Some(Some(Entry::Node(Arc::new(branch))))
                }
                None => {
                    if entries.len() == 1 {
                        return Some(None);
                    }
                    if entries.len() == 2 && shift > 0 {
                        let other = &entries[1 - pos];
                        if other.is_leaf() {
                            return Some(Some(other.clone()));
                        }
                    }
                    let mut entries = entries.clone();
                    entries.remove(pos);
                    let branch = Node::Branch {
                        bitmap: bitmap & !bit,
                        entries,
                    };
                    Some(Some(Entry::Node(Arc::new(branch))))
                }
            }
        }
        Node::Collision {
            hash: shared,
            entries,
        } => {
            if *shared != hash {
                return None;
            }
            let pos = entries.iter().position(|e| leaf_matches(e, hash, key))?;
            if entries.len() == 2 {
                return Some(Some(entries[1 - pos].clone()));
            }
            let mut entries = entries.clone();
            entries.remove(pos);
            Some(Some(Entry::Node(Arc::new(Node::Collision { hash, entries }))))
        }
    }
}

/// Immutable hash map with structural sharing.
///
/// `with` and `without` return a new map and leave `self` untouched. Cloning
/// is O(1).
pub struct PersistentMap<K, V> {
    root: Option<Arc<Node<K, V>>>,
    len: usize,
}

impl<K, V> Clone for PersistentMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PersistentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> PersistentMap<K, V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates entries in hash order. Each call starts a fresh traversal.
    pub fn iter(&self) -> Iter<'_, K, V> {
        let stack = match &self.root {
            Some(root) => vec![root.entries().iter()],
            None => Vec::new(),
        };
        Iter {
            stack,
            remaining: self.len,
        }
    }

    /// Whether both maps are the same version (share the same root).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<K: Hash + Eq, V> PersistentMap<K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = hash_of(key);
        let mut node = self.root.as_deref()?;
        let mut shift = 0;

        loop {
            match node {
                Node::Branch { bitmap, entries } => {
                    let bit = 1 << fragment(hash, shift);
                    if bitmap & bit == 0 {
                        return None;
                    }
                    match &entries[slot(*bitmap, bit)] {
                        Entry::Leaf(h, kv) => {
                            return (*h == hash && kv.0.borrow() == key).then_some(&kv.1);
                        }
                        Entry::Node(child) => {
                            node = &**child;
                            shift += BITS;
                        }
                    }
                }
                Node::Collision { entries, .. } => {
                    return entries.iter().find_map(|e| match e {
                        Entry::Leaf(h, kv) if *h == hash && kv.0.borrow() == key => Some(&kv.1),
                        _ => None,
                    });
                }
            }
        }
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Returns a map with `key` bound to `value`.
    pub fn with(&self, key: K, value: V) -> Self {
        let hash = hash_of(&key);
        let leaf = Entry::Leaf(hash, Arc::new((key, value)));

        let (root, added) = match &self.root {
            Some(root) => insert(root, 0, hash, leaf),
            None => {
                let branch = Node::Branch {
                    bitmap: 1 << fragment(hash, 0),
                    entries: vec![leaf],
                };
                (Arc::new(branch), true)
            }
        };

        Self {
            root: Some(root),
            len: self.len + usize::from(added),
        }
    }

    /// Returns a map without `key`. Shares the root when `key` is absent.
    pub fn without<Q>(&self, key: &Q) -> Self
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(root) = &self.root else {
            return self.clone();
        };

        match remove(root, 0, hash_of(key), key) {
            None => self.clone(),
            Some(None) => Self::new(),
            Some(Some(Entry::Node(root))) => Self {
                root: Some(root),
                len: self.len - 1,
            },
            Some(Some(leaf)) => {
                // The root never collapses, but keep the invariant if it did.
                let bitmap = 1 << fragment(leaf.hash(), 0);
                Self {
                    root: Some(Arc::new(Node::Branch {
                        bitmap,
                        entries: vec![leaf],
                    })),
                    len: self.len - 1,
                }
            }
        }
    }
}

pub struct Iter<'a, K, V> {
    stack: Vec<std::slice::Iter<'a, Entry<K, V>>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                None => {
                    self.stack.pop();
                }
                Some(Entry::Leaf(_, kv)) => {
                    self.remaining -= 1;
                    return Some((&kv.0, &kv.1));
                }
                Some(Entry::Node(node)) => self.stack.push(node.entries().iter()),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

impl<'a, K, V> IntoIterator for &'a PersistentMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: Hash + Eq, V> FromIterator<(K, V)> for PersistentMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (k, v)| map.with(k, v))
    }
}

impl<K: Hash + Eq, V: PartialEq> PartialEq for PersistentMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Hash + Eq, V: Eq> Eq for PersistentMap<K, V> {}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for PersistentMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Serialize, V: Serialize> Serialize for PersistentMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct MapVisitor<K, V>(PhantomData<(K, V)>);

impl<'de, K, V> Visitor<'de> for MapVisitor<K, V>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
{
    type Value = PersistentMap<K, V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = PersistentMap::new();
        while let Some((k, v)) = access.next_entry()? {
            map = map.with(k, v);
        }
        Ok(map)
    }
}

impl<'de, K, V> Deserialize<'de> for PersistentMap<K, V>
where
    K: Deserialize<'de> + Hash + Eq,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(MapVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Key whose hash ignores everything but `bucket`, to force collisions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Colliding {
        bucket: u8,
        id: u32,
    }

    impl Hash for Colliding {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.bucket.hash(state);
        }
    }

    #[test]
    fn test_empty_map() {
        let map: PersistentMap<String, u32> = PersistentMap::new();
        assert!(map.is_empty());
        assert_eq!(map.get("missing"), None);
        assert_eq!(map.iter().count(), 0);
    }

    #[test]
    fn test_with_keeps_previous_version() {
        let v1 = PersistentMap::new().with("a".to_string(), 1);
        let v2 = v1.with("b".to_string(), 2);
        let v3 = v2.with("a".to_string(), 10);

        assert_eq!(v1.len(), 1);
        assert_eq!(v1.get("a"), Some(&1));
        assert_eq!(v1.get("b"), None);

        assert_eq!(v2.len(), 2);
        assert_eq!(v2.get("a"), Some(&1));

        assert_eq!(v3.len(), 2);
        assert_eq!(v3.get("a"), Some(&10));
        assert_eq!(v3.get("b"), Some(&2));
    }

    #[test]
    fn test_without_keeps_previous_version() {
        let full: PersistentMap<u32, u32> = (0..100).map(|i| (i, i * 2)).collect();
        let trimmed = full.without(&42);

        assert_eq!(full.len(), 100);
        assert_eq!(full.get(&42), Some(&84));
        assert_eq!(trimmed.len(), 99);
        assert_eq!(trimmed.get(&42), None);
        assert_eq!(trimmed.get(&41), Some(&82));
    }

    #[test]
    fn test_without_missing_key_shares_root() {
        let map: PersistentMap<u32, u32> = (0..10).map(|i| (i, i)).collect();
        let same = map.without(&999);
        assert!(map.ptr_eq(&same));
        assert_eq!(same.len(), 10);
    }

    #[test]
    fn test_matches_std_hashmap_under_churn() {
        let mut model = HashMap::new();
        let mut map = PersistentMap::new();

        for i in 0..5_000u32 {
            let key = (i * 7919) % 1_237;
            if i % 3 == 0 {
                model.remove(&key);
                map = map.without(&key);
            } else {
                model.insert(key, i);
                map = map.with(key, i);
            }
            assert_eq!(map.len(), model.len());
        }

        for (k, v) in &model {
            assert_eq!(map.get(k), Some(v));
        }
        let collected: HashMap<u32, u32> = map.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(collected, model);
    }

    #[test]
    fn test_remove_everything_empties_map() {
        let mut map: PersistentMap<u32, ()> = (0..2_000).map(|i| (i, ())).collect();
        for i in 0..2_000 {
            map = map.without(&i);
        }
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
        assert!(map.ptr_eq(&PersistentMap::new()));
    }

    #[test]
    fn test_full_hash_collisions() {
        let keys: Vec<Colliding> = (0..5).map(|id| Colliding { bucket: 1, id }).collect();
        let mut map = PersistentMap::new();
        for k in &keys {
            map = map.with(k.clone(), k.id);
        }
        // A key with a different hash must split the collision node.
        map = map.with(Colliding { bucket: 2, id: 99 }, 99);

        assert_eq!(map.len(), 6);
        for k in &keys {
            assert_eq!(map.get(k), Some(&k.id));
        }
        assert_eq!(map.get(&Colliding { bucket: 2, id: 99 }), Some(&99));
        assert_eq!(map.get(&Colliding { bucket: 1, id: 77 }), None);

        let updated = map.with(keys[2].clone(), 500);
        assert_eq!(updated.len(), 6);
        assert_eq!(updated.get(&keys[2]), Some(&500));
        assert_eq!(map.get(&keys[2]), Some(&2));

        let mut shrinking = updated;
        for k in &keys {
            shrinking = shrinking.without(k);
        }
        assert_eq!(shrinking.len(), 1);
        assert_eq!(shrinking.get(&Colliding { bucket: 2, id: 99 }), Some(&99));
    }

    #[test]
    fn test_iteration_is_restartable() {
        let map: PersistentMap<u32, u32> = (0..300).map(|i| (i, i)).collect();
        let first: u32 = map.iter().map(|(_, v)| *v).sum();
        let second: u32 = map.iter().map(|(_, v)| *v).sum();
        assert_eq!(first, second);
        assert_eq!(map.iter().len(), 300);
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let forward: PersistentMap<u32, u32> = (0..64).map(|i| (i, i)).collect();
        let backward: PersistentMap<u32, u32> = (0..64).rev().map(|i| (i, i)).collect();
        assert_eq!(forward, backward);
        assert_ne!(forward, backward.with(0, 1));
    }

    #[test]
    fn test_serde_through_bincode() {
        let map: PersistentMap<String, Vec<u8>> = (0..50)
            .map(|i| (format!("key{}", i), vec![i as u8; 3]))
            .collect();
        let bytes = bincode::serialize(&map).unwrap();
        let decoded: PersistentMap<String, Vec<u8>> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_concurrent_readers_on_old_root() {
        use std::thread;

        let base: PersistentMap<u32, u32> = (0..1_000).map(|i| (i, i)).collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let snapshot = base.clone();
                thread::spawn(move || snapshot.iter().map(|(_, v)| *v as u64).sum::<u64>())
            })
            .collect();

        let mut writer = base.clone();
        for i in 0..1_000 {
            writer = writer.without(&i);
        }

        for reader in readers {
            assert_eq!(reader.join().unwrap(), (0..1_000u64).sum::<u64>());
        }
        assert!(writer.is_empty());
        assert_eq!(base.len(), 1_000);
    }
}
