use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::Storage;
use crate::error::Result;

/// Objects held in memory.
///
/// Share one instance through an `Arc` to simulate a restart: drop the state,
/// open a new one on the same storage. Each `fail_next_*` switch makes the
/// next matching call fail with an I/O error and then resets itself.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_append: AtomicBool,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    fail_sync: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_append(&self) {
        self.fail_append.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_put(&self) {
        self.fail_put.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    /// Fails the next sync of `name` only.
    pub fn fail_next_sync(&self, name: &str) {
        if let Ok(mut target) = self.fail_sync.lock() {
            *target = Some(name.to_string());
        }
    }

    /// Cuts `name` down to `len` bytes, as a crash mid-write would.
    pub fn truncate(&self, name: &str, len: usize) -> Result<()> {
        let mut objects = self.objects.lock()?;
        let object = objects.get_mut(name).ok_or_else(|| not_found(name))?;
        object.truncate(len);
        Ok(())
    }

    /// Overwrites one byte of `name`.
    pub fn corrupt(&self, name: &str, offset: usize) -> Result<()> {
        let mut objects = self.objects.lock()?;
        let object = objects.get_mut(name).ok_or_else(|| not_found(name))?;
        if let Some(byte) = object.get_mut(offset) {
            *byte ^= 0xff;
        }
        Ok(())
    }

    pub fn size(&self, name: &str) -> Option<usize> {
        self.objects.lock().ok()?.get(name).map(Vec::len)
    }

    fn injected(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, format!("injected {} failure", op)).into());
        }
        Ok(())
    }
}

fn not_found(name: &str) -> crate::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no object named {}", name)).into()
}

impl Storage for MemoryStorage {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.objects.lock()?.keys().cloned().collect())
    }

    fn append(&self, name: &str, bytes: &[u8]) -> Result<()> {
        Self::injected(&self.fail_append, "append")?;
        self.objects
            .lock()?
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn sync(&self, name: &str) -> Result<()> {
        {
            let mut target = self.fail_sync.lock()?;
            if target.as_deref() == Some(name) {
                *target = None;
                return Err(io::Error::new(io::ErrorKind::Other, "injected sync failure").into());
            }
        }
        if self.objects.lock()?.contains_key(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()?
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let objects = self.objects.lock()?;
        let object = objects.get(name).ok_or_else(|| not_found(name))?;
        let start = (offset as usize).min(object.len());
        let end = start.saturating_add(len).min(object.len());
        Ok(object[start..end].to_vec())
    }

    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        Self::injected(&self.fail_put, "put")?;
        self.objects.lock()?.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        Self::injected(&self.fail_delete, "delete")?;
        self.objects.lock()?.remove(name);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_injected_failure_fires_once() {
        let storage = MemoryStorage::new();
        storage.fail_next_append();

        assert!(matches!(
            storage.append("x", b"1"),
            Err(Error::StorageUnavailable(_))
        ));
        assert!(storage.list().unwrap().is_empty());

        storage.append("x", b"1").unwrap();
        assert_eq!(storage.read("x").unwrap(), b"1");
    }

    #[test]
    fn test_sync_failure_targets_one_object() {
        let storage = MemoryStorage::new();
        storage.append("a", b"1").unwrap();
        storage.append("b", b"2").unwrap();
        storage.fail_next_sync("b");

        storage.sync("a").unwrap();
        assert!(matches!(storage.sync("b"), Err(Error::StorageUnavailable(_))));
        storage.sync("b").unwrap();
    }

    #[test]
    fn test_read_range_clamps_to_object() {
        let storage = MemoryStorage::new();
        storage.append("x", b"abcdef").unwrap();

        assert_eq!(storage.read_range("x", 2, 2).unwrap(), b"cd");
        assert_eq!(storage.read_range("x", 4, 10).unwrap(), b"ef");
        assert!(storage.read_range("x", 10, 4).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_and_corrupt() {
        let storage = MemoryStorage::new();
        storage.put("s", &[1, 2, 3, 4]).unwrap();

        storage.corrupt("s", 1).unwrap();
        assert_eq!(storage.read("s").unwrap(), vec![1, 0xfd, 3, 4]);

        storage.truncate("s", 2).unwrap();
        assert_eq!(storage.size("s"), Some(2));
        assert!(storage.truncate("missing", 0).is_err());
    }

    #[test]
    fn test_failed_delete_keeps_object() {
        let storage = MemoryStorage::new();
        storage.put("keep", b"v").unwrap();
        storage.fail_next_delete();

        assert!(storage.delete("keep").is_err());
        assert_eq!(storage.list().unwrap(), vec!["keep".to_string()]);
        storage.delete("keep").unwrap();
        storage.delete("keep").unwrap();
        assert!(storage.list().unwrap().is_empty());
    }
}
