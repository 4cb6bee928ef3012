//! Transaction log: the durable history behind a state.
//!
//! The log is an append-only sequence of `(version, transaction)` records
//! spread over segments, plus full-cache snapshots that bound replay:
//!
//! ```text
//!   snapshot@v3          segment@1           segment@4          segment@6 (active)
//!   +---------+        +-----------+       +-----------+       +-----------+
//!   | cache@3 |        | 1 | 2 | 3 |       | 4 | 5     |       | 6 | 7 ... |
//!   +---------+        +-----------+       +-----------+       +-----------+
//!                      `- redundant once snapshot@3 is durable
//! ```
//!
//! # Ordering
//!
//! - **Log, then apply**: a record is written to storage before the
//!   transaction touches the cache. A crash in between replays the record on
//!   restart; a failed write leaves the cache untouched.
//! - **Dense versions**: "next version, write, apply, publish" runs under one
//!   writer lock, so versions are strictly increasing with no gaps.
//! - **Write new, then delete old**: compaction deletes superseded segments
//!   and snapshots only after the new snapshot is durable. An interrupted
//!   compaction leaves orphans that the next one removes.
//!
//! # Lifecycle
//!
//! `Unopened -> reset_to_latest -> Ready -> close -> Closed`. A failed append
//! moves the log to `Failed`: the segment tail may be torn and only reopening
//! recovers a trustworthy state. Operations outside `Ready` return
//! [`Error::InvalidState`].

mod cleanup;
mod recovery;
pub mod segment;
pub mod snapshot;

use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use tokio::sync::oneshot;

use crate::config::LogOptions;
use crate::error::Result;
use crate::executor::Executor;
use crate::metrics::LogStats;
use crate::registry::Registry;
use crate::storage::Storage;
use crate::transaction::{Snapshot, Transaction};
use crate::version::Version;
use crate::Error;

use segment::{encode_record, segment_name, SegmentHeader, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unopened,
    Ready,
    Failed,
    Closed,
}

struct ActiveSegment {
    name: String,
    base: Version,
    bytes: u64,
}

struct Writer {
    lifecycle: Lifecycle,
    version: Version,
    committed: Version,
    snapshot: Version,
    segment: Option<ActiveSegment>,
}

impl Writer {
    fn ensure_ready(&self, op: &str) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Unopened => Err(Error::InvalidState(format!(
                "{} before reset_to_latest",
                op
            ))),
            Lifecycle::Failed => Err(Error::InvalidState(format!(
                "{} after a failed append; reopen the state",
                op
            ))),
            Lifecycle::Closed => Err(Error::InvalidState(format!("{} after close", op))),
        }
    }

    fn ensure_opened(&self, op: &str) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready | Lifecycle::Failed => Ok(()),
            _ => self.ensure_ready(op),
        }
    }

    fn active(&mut self) -> Result<&mut ActiveSegment> {
        self.segment
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no active segment".to_string()))
    }
}

/// Log manager for one state instance.
///
/// The cache lives with the caller as an [`ArcSwap`]; the log publishes each
/// new root into it. Readers load the current root without taking any lock.
pub struct TransactionLog<T> {
    storage: Arc<dyn Storage>,
    registry: Registry<T>,
    options: LogOptions,
    writer: Mutex<Writer>,
    compaction: Mutex<()>,
    executor: RwLock<Option<Arc<dyn Executor>>>,
}

impl<T: Transaction> std::fmt::Debug for TransactionLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("registry", &self.registry)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl<T: Transaction> TransactionLog<T> {
    pub fn new(storage: Arc<dyn Storage>, registry: Registry<T>, options: LogOptions) -> Self {
        Self {
            storage,
            registry,
            options,
            writer: Mutex::new(Writer {
                lifecycle: Lifecycle::Unopened,
                version: Version::ZERO,
                committed: Version::ZERO,
                snapshot: Version::ZERO,
                segment: None,
            }),
            compaction: Mutex::new(()),
            executor: RwLock::new(None),
        }
    }

    pub fn lifecycle(&self) -> Option<Lifecycle> {
        self.writer.lock().ok().map(|w| w.lifecycle)
    }

    /// Loads the latest snapshot, replays the log after it and publishes the
    /// result into `cache`. Valid once, on an unopened log.
    pub fn reset_to_latest(&self, cache: &ArcSwap<T::Cache>) -> Result<()> {
        let mut writer = self.writer.lock()?;
        if writer.lifecycle != Lifecycle::Unopened {
            return Err(Error::InvalidState(format!(
                "reset_to_latest on a {:?} log",
                writer.lifecycle
            )));
        }

        let recovered = recovery::recover(self.storage.as_ref(), &self.registry)?;

        if let Some((name, bytes)) = &recovered.repaired_tail {
            self.storage
                .put(name, bytes)
                .map_err(|e| e.into_recovery(&format!("repairing segment {}", name)))?;
        }

        let base = recovered
            .version
            .next()
            .map_err(|e| e.into_recovery("starting segment"))?;
        if recovered.segments.contains(&base) {
            tracing::warn!(segment = %segment_name(base), "Replacing incomplete segment");
        }
        let segment = self
            .start_segment(base)
            .map_err(|e| e.into_recovery("starting segment"))?;

        cache.store(Arc::new(recovered.cache));
        writer.version = recovered.version;
        writer.committed = recovered.version;
        writer.snapshot = recovered.snapshot_version;
        writer.segment = Some(segment);
        writer.lifecycle = Lifecycle::Ready;

        tracing::info!(
            version = %recovered.version,
            snapshot_version = %recovered.snapshot_version,
            replayed = recovered.replayed,
            "Transaction log ready"
        );
        Ok(())
    }

    /// Durably appends `tx` at the next version, then applies it to `cache`.
    ///
    /// On error the cache is unchanged. A failed write also fails the log.
    pub fn append_and_apply(&self, tx: &T, cache: &ArcSwap<T::Cache>) -> Result<T::Output> {
        let mut writer = self.writer.lock()?;
        let version = self.append_locked(&mut writer, tx)?;

        let current = cache.load_full();
        let (next, output) = tx.apply(&current);
        let previous = cache.compare_and_swap(&current, Arc::new(next));
        if !Arc::ptr_eq(&previous, &current) {
            writer.lifecycle = Lifecycle::Failed;
            tracing::error!(
                version = %version,
                "Cache replaced outside the log while applying"
            );
            return Err(Error::VersionConflict {
                expected: writer.version,
                actual: version,
            });
        }
        writer.version = version;

        self.maybe_roll(&mut writer);
        Ok(output)
    }

    fn append_locked(&self, writer: &mut Writer, tx: &T) -> Result<Version> {
        writer.ensure_ready("append")?;

        let entry = self.registry.encode(tx)?;
        let version = writer.version.next()?;
        let record = encode_record(version, &entry)?;

        let name = writer.active()?.name.clone();
        if let Err(e) = self.write_record(&name, &record) {
            writer.lifecycle = Lifecycle::Failed;
            tracing::error!(
                version = %version,
                segment = %name,
                error = %e,
                "Append failed, log is no longer writable"
            );
            return Err(e);
        }
        writer.active()?.bytes += record.len() as u64;

        Ok(version)
    }

    fn write_record(&self, name: &str, record: &[u8]) -> Result<()> {
        self.storage.append(name, record)?;
        if self.options.sync_on_append {
            self.storage.sync(name)?;
        }
        Ok(())
    }

    fn maybe_roll(&self, writer: &mut Writer) {
        let full = writer
            .segment
            .as_ref()
            .map_or(false, |s| s.bytes >= self.options.segment_size);
        if !full {
            return;
        }
        // The append already succeeded; keep writing to the old segment and
        // retry on the next append if the roll fails.
        if let Err(e) = self.roll(writer) {
            tracing::warn!(error = %e, "Failed to roll log segment");
        }
    }

    /// Starts a segment at `version + 1` unless the active one already is.
    fn roll(&self, writer: &mut Writer) -> Result<()> {
        let base = writer.version.next()?;
        let old = writer.active()?;
        if old.base == base {
            return Ok(());
        }

        self.storage.sync(&old.name)?;
        let old_name = old.name.clone();
        let segment = self.start_segment(base)?;
        tracing::debug!(
            previous = %old_name,
            segment = %segment.name,
            "Rolled log segment"
        );
        writer.segment = Some(segment);
        Ok(())
    }

    /// Writes a fresh segment at `base`. Whatever an earlier attempt left
    /// under that name holds no records yet and is discarded first.
    fn start_segment(&self, base: Version) -> Result<ActiveSegment> {
        let name = segment_name(base);
        self.storage.delete(&name)?;

        self.storage.append(&name, &SegmentHeader::new(base).encode())?;
        if self.options.sync_on_append {
            self.storage.sync(&name)?;
        }

        Ok(ActiveSegment {
            name,
            base,
            bytes: HEADER_SIZE as u64,
        })
    }

    /// Makes every append so far durable.
    pub fn commit(&self) -> Result<Version> {
        let mut writer = self.writer.lock()?;
        writer.ensure_ready("commit")?;
        let version = writer.version;
        self.commit_locked(&mut writer, version)?;
        Ok(version)
    }

    /// Makes appends up to `version` durable. Fails if `version` has not
    /// been assigned yet.
    pub fn commit_to(&self, version: Version) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.ensure_ready("commit")?;
        if version > writer.version {
            return Err(Error::InvalidState(format!(
                "commit to {} beyond current version {}",
                version, writer.version
            )));
        }
        if version <= writer.committed {
            return Ok(());
        }
        self.commit_locked(&mut writer, version)
    }

    fn commit_locked(&self, writer: &mut Writer, version: Version) -> Result<()> {
        let name = writer.active()?.name.clone();
        if let Err(e) = self.storage.sync(&name) {
            writer.lifecycle = Lifecycle::Failed;
            tracing::error!(
                version = %version,
                segment = %name,
                error = %e,
                "Commit failed, log is no longer writable"
            );
            return Err(e);
        }
        writer.committed = writer.committed.max(version);
        tracing::debug!(version = %version, "Committed");
        Ok(())
    }

    pub fn committed_version(&self) -> Result<Version> {
        let writer = self.writer.lock()?;
        writer.ensure_opened("committed_version")?;
        Ok(writer.committed)
    }

    /// Highest assigned version.
    pub fn version(&self) -> Result<Version> {
        let writer = self.writer.lock()?;
        writer.ensure_opened("version")?;
        Ok(writer.version)
    }

    /// Writes a snapshot of `cache` at the current version and deletes what
    /// it supersedes. Returns the snapshot version.
    ///
    /// Appends are blocked only while the version and cache root are
    /// captured; the snapshot itself is written from that captured root.
    pub fn compact(&self, cache: &ArcSwap<T::Cache>) -> Result<Version> {
        let _serial = self.compaction.lock()?;

        let (version, root, previous) = {
            let mut writer = self.writer.lock()?;
            writer.ensure_ready("compact")?;
            let root = cache.load_full();
            self.roll(&mut writer)?;
            (writer.version, root, writer.snapshot)
        };

        if version > previous {
            let name = snapshot::write_snapshot(self.storage.as_ref(), version, root.as_ref())?;
            tracing::info!(
                snapshot = %name,
                version = %version,
                entries = root.entry_count(),
                "Wrote snapshot"
            );

            let mut writer = self.writer.lock()?;
            writer.snapshot = writer.snapshot.max(version);
        }

        let report = cleanup::cleanup(self.storage.as_ref(), version);
        tracing::info!(
            version = %version,
            deleted = report.deleted.len(),
            orphaned = report.orphaned.len(),
            "Compaction completed"
        );
        Ok(version)
    }

    /// Runs [`compact`](Self::compact) on the configured executor.
    pub fn compact_async(self: &Arc<Self>, cache: Arc<ArcSwap<T::Cache>>) -> Result<CompactionHandle> {
        let executor = self
            .executor
            .read()?
            .clone()
            .ok_or_else(|| Error::InvalidState("compact_async before set_executor".to_string()))?;
        self.writer.lock()?.ensure_ready("compact")?;

        let (tx, rx) = oneshot::channel();
        let log = Arc::clone(self);
        executor.execute(Box::new(move || {
            let result = log.compact(&cache);
            if let Err(e) = &result {
                tracing::error!(error = %e, "Asynchronous compaction failed");
            }
            let _ = tx.send(result);
        }))?;

        Ok(CompactionHandle { rx })
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Result<()> {
        *self.executor.write()? = Some(executor);
        Ok(())
    }

    pub fn stats(&self, cache: &ArcSwap<T::Cache>) -> Result<LogStats> {
        let writer = self.writer.lock()?;
        writer.ensure_opened("stats")?;
        Ok(LogStats {
            version: writer.version,
            committed_version: writer.committed,
            snapshot_version: writer.snapshot,
            active_segment_bytes: writer.segment.as_ref().map_or(0, |s| s.bytes),
            cache_entries: cache.load().entry_count(),
        })
    }

    /// Syncs outstanding appends and releases storage handles. Waits for a
    /// running compaction to finish first.
    pub fn close(&self) -> Result<()> {
        let _serial = self.compaction.lock()?;
        let mut writer = self.writer.lock()?;

        let synced = match (writer.lifecycle, writer.segment.as_ref()) {
            (Lifecycle::Closed, _) => {
                return Err(Error::InvalidState("close on a closed log".to_string()));
            }
            (Lifecycle::Ready, Some(segment)) => self.storage.sync(&segment.name),
            _ => Ok(()),
        };
        if synced.is_ok() && writer.lifecycle == Lifecycle::Ready {
            writer.committed = writer.version;
        }

        writer.lifecycle = Lifecycle::Closed;
        writer.segment = None;
        let released = self.storage.release();

        tracing::info!(version = %writer.version, "Transaction log closed");
        synced.and(released)
    }

    /// Durably appends `tx` without applying it, leaving the log as a crash
    /// between the two steps would.
    #[cfg(test)]
    pub(crate) fn append_without_apply(&self, tx: &T) -> Result<Version> {
        let mut writer = self.writer.lock()?;
        let version = self.append_locked(&mut writer, tx)?;
        writer.version = version;
        Ok(version)
    }
}

/// Completion of an asynchronous compaction.
#[derive(Debug)]
pub struct CompactionHandle {
    rx: oneshot::Receiver<Result<Version>>,
}

impl CompactionHandle {
    pub async fn join(self) -> Result<Version> {
        self.rx.await.map_err(|_| dropped())?
    }

    /// Blocks the calling thread. Must not be called from async code.
    pub fn wait(self) -> Result<Version> {
        self.rx.blocking_recv().map_err(|_| dropped())?
    }
}

fn dropped() -> Error {
    Error::InvalidState("compaction dropped before completing".to_string())
}
