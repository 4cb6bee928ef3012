//! Byte-level storage the log and snapshots live on.
//!
//! The log manager needs very little from its substrate: append bytes to a
//! named object, sync it, read it back, list and delete objects, and write a
//! whole object atomically. Anything that provides those (a local directory,
//! a distributed filesystem client, memory for tests) can back a state.
//!
//! Implementations do not retry. A failed call surfaces as
//! [`Error::StorageUnavailable`](crate::Error::StorageUnavailable) and the
//! caller decides what to do.

pub mod local;
pub mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use crate::error::Result;

pub trait Storage: Send + Sync {
    /// Names of all complete objects. Objects still being written by `put`
    /// are not listed.
    fn list(&self) -> Result<Vec<String>>;

    /// Appends `bytes` to `name`, creating it if needed. Once this returns the
    /// bytes survive a process crash; `sync` makes them survive a machine crash.
    fn append(&self, name: &str, bytes: &[u8]) -> Result<()>;

    fn sync(&self, name: &str) -> Result<()>;

    fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Reads up to `len` bytes at `offset`. Shorter results mean end of object.
    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Replaces `name` with `bytes` atomically and durably. Readers see either
    /// the old object (or none) or the complete new one.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Deletes `name`. Deleting a missing object succeeds.
    fn delete(&self, name: &str) -> Result<()>;

    /// Releases cached handles and any ownership lease held on the
    /// substrate. Later calls may reopen handles but do not retake the lease.
    fn release(&self) -> Result<()>;
}
