use itertools::Itertools;

use super::segment::{parse_segment_name, SegmentHeader, SegmentReader, HEADER_SIZE};
use super::snapshot::{parse_snapshot_name, read_snapshot};
use crate::error::Result;
use crate::registry::Registry;
use crate::storage::Storage;
use crate::transaction::Transaction;
use crate::version::Version;
use crate::Error;

/// Outcome of replaying persisted history.
pub(crate) struct Recovered<C> {
    pub cache: C,
    pub version: Version,
    pub snapshot_version: Version,
    /// Base versions of every segment found, in order.
    pub segments: Vec<Version>,
    pub replayed: u64,
    /// Last segment cut back to its complete records, when its tail was torn.
    pub repaired_tail: Option<(String, Vec<u8>)>,
}

/// Rebuilds the cache from the latest snapshot and the log suffix after it.
pub(crate) fn recover<T: Transaction>(
    storage: &dyn Storage,
    registry: &Registry<T>,
) -> Result<Recovered<T::Cache>> {
    let names = storage
        .list()
        .map_err(|e| e.into_recovery("listing state objects"))?;

    let (snapshot_version, mut cache) = match names
        .iter()
        .filter_map(|name| parse_snapshot_name(name).map(|v| (v, name)))
        .max_by_key(|(v, _)| *v)
    {
        Some((version, name)) => {
            let (_, cache) = read_snapshot::<T::Cache>(storage, name)
                .map_err(|e| e.into_recovery(&format!("snapshot {}", name)))?;
            tracing::debug!(snapshot = %name, version = %version, "Loaded snapshot");
            (version, cache)
        }
        None => (Version::ZERO, T::Cache::default()),
    };

    let segments: Vec<(Version, &String)> = names
        .iter()
        .filter_map(|name| parse_segment_name(name).map(|base| (base, name)))
        .sorted_by_key(|(base, _)| *base)
        .collect();

    let mut version = snapshot_version;
    let mut replayed = 0u64;
    let mut repaired_tail = None;

    for (i, &(base, name)) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let bytes = storage
            .read(name)
            .map_err(|e| e.into_recovery(&format!("segment {}", name)))?;

        if bytes.len() < HEADER_SIZE {
            tracing::warn!(
                segment = %name,
                bytes = bytes.len(),
                "Segment header is incomplete, treating segment as empty"
            );
            continue;
        }

        let header = SegmentHeader::decode(&bytes[..HEADER_SIZE])
            .map_err(|e| e.into_recovery(&format!("segment {}", name)))?;
        if header.base != base {
            return Err(Error::Recovery(format!(
                "segment {} declares base {}",
                name, header.base
            )));
        }

        let mut reader = SegmentReader::new(&bytes[HEADER_SIZE..]);
        let mut first = true;
        for record in reader.by_ref() {
            let record = record.map_err(|e| e.into_recovery(&format!("segment {}", name)))?;

            if first && record.version != base {
                return Err(Error::Recovery(format!(
                    "segment {} starts at version {}",
                    name, record.version
                )));
            }
            first = false;

            if record.version <= snapshot_version {
                continue;
            }

            let expected = version.next().map_err(|e| e.into_recovery(name))?;
            if record.version != expected {
                return Err(Error::Recovery(format!(
                    "version gap in segment {}: expected {}, found {}",
                    name, expected, record.version
                )));
            }

            let tx = registry.decode(&record.entry).map_err(|e| {
                e.into_recovery(&format!("segment {} version {}", name, record.version))
            })?;
            cache = tx.apply(&cache).0;
            version = record.version;
            replayed += 1;
        }

        if reader.torn() {
            // Only the segment being written at a crash can end mid-record.
            if !last {
                return Err(Error::Recovery(format!(
                    "segment {} ends mid-record but later segments exist",
                    name
                )));
            }
            let valid = HEADER_SIZE + reader.position();
            tracing::warn!(
                segment = %name,
                valid_bytes = valid,
                total_bytes = bytes.len(),
                "Torn record at end of segment, ignoring the tail"
            );
            repaired_tail = Some((name.clone(), bytes[..valid].to_vec()));
        }
    }

    tracing::info!(
        version = %version,
        snapshot_version = %snapshot_version,
        replayed = replayed,
        segments = segments.len(),
        "Recovered state from log"
    );

    Ok(Recovered {
        cache,
        version,
        snapshot_version,
        segments: segments.into_iter().map(|(base, _)| base).collect(),
        replayed,
        repaired_tail,
    })
}
