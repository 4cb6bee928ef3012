//! Snapshot object format.
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|  magic "ASHST\0SN", format:u32, version:u128,
//! |                  |  payload_len:u64, crc32:u32
//! +------------------+
//! | Payload          |  encoded cache
//! +------------------+
//! ```
//!
//! A snapshot is written with a single `put`, so it is either absent or
//! complete. The checksum still guards against bit rot.

use byteorder::{BigEndian, ReadBytesExt};

use super::segment::CRC32;
use crate::error::Result;
use crate::storage::Storage;
use crate::transaction::Snapshot;
use crate::version::Version;
use crate::Error;

pub const HEADER_SIZE: usize = 64;
pub const EXTENSION: &str = ".snap";

const MAGIC: &[u8; 8] = b"ASHST\x00SN";
const FORMAT: u32 = 1;

pub fn snapshot_name(version: Version) -> String {
    format!("{:032x}{}", version.get(), EXTENSION)
}

pub fn parse_snapshot_name(name: &str) -> Option<Version> {
    let stem = name.strip_suffix(EXTENSION)?;
    if stem.len() != 32 {
        return None;
    }
    u128::from_str_radix(stem, 16).ok().map(Version::new)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotHeader {
    pub magic: [u8; 8],
    pub format: u32,
    pub version: Version,
    pub payload_len: u64,
    pub checksum: u32,
}

impl SnapshotHeader {
    pub fn new(version: Version, payload: &[u8]) -> Self {
        SnapshotHeader {
            magic: *MAGIC,
            format: FORMAT,
            version,
            payload_len: payload.len() as u64,
            checksum: CRC32.checksum(payload),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidHeader("bad snapshot magic".to_string()));
        }
        if self.format != FORMAT {
            return Err(Error::InvalidHeader(format!(
                "unsupported snapshot format {}",
                self.format
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.format.to_be_bytes());
        buf[12..28].copy_from_slice(&self.version.get().to_be_bytes());
        buf[28..36].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "snapshot header needs {} bytes, found {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let header = Self {
            magic,
            format: (&bytes[8..12]).read_u32::<BigEndian>()?,
            version: Version::new((&bytes[12..28]).read_u128::<BigEndian>()?),
            payload_len: (&bytes[28..36]).read_u64::<BigEndian>()?,
            checksum: (&bytes[36..40]).read_u32::<BigEndian>()?,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Writes `cache` as the snapshot for `version`.
pub fn write_snapshot<C: Snapshot>(storage: &dyn Storage, version: Version, cache: &C) -> Result<String> {
    let payload = cache.encode_snapshot()?;
    let header = SnapshotHeader::new(version, &payload);

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&header.encode());
    bytes.extend_from_slice(&payload);

    let name = snapshot_name(version);
    storage.put(&name, &bytes)?;
    Ok(name)
}

/// Loads and verifies the snapshot stored under `name`.
pub fn read_snapshot<C: Snapshot>(storage: &dyn Storage, name: &str) -> Result<(Version, C)> {
    let header_bytes = storage.read_range(name, 0, HEADER_SIZE)?;
    let header = SnapshotHeader::decode(&header_bytes)?;

    if parse_snapshot_name(name) != Some(header.version) {
        return Err(Error::InvalidHeader(format!(
            "{} holds version {}",
            name, header.version
        )));
    }

    let len = usize::try_from(header.payload_len)
        .map_err(|_| Error::Decode("snapshot", format!("payload of {} bytes", header.payload_len)))?;
    let payload = storage.read_range(name, HEADER_SIZE as u64, len)?;
    if payload.len() != len {
        return Err(Error::Decode(
            "snapshot",
            format!("expected {} payload bytes, found {}", len, payload.len()),
        ));
    }
    if CRC32.checksum(&payload) != header.checksum {
        return Err(Error::ChecksumMismatch);
    }

    Ok((header.version, C::decode_snapshot(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PersistentMap;
    use crate::storage::MemoryStorage;

    type Map = PersistentMap<String, u64>;

    fn sample() -> Map {
        (0..50).map(|i| (format!("key{}", i), i)).collect()
    }

    #[test]
    fn test_write_then_read() {
        let storage = MemoryStorage::new();
        let name = write_snapshot(&storage, Version::new(7), &sample()).unwrap();
        assert_eq!(name, snapshot_name(Version::new(7)));

        let (version, cache): (Version, Map) = read_snapshot(&storage, &name).unwrap();
        assert_eq!(version, Version::new(7));
        assert_eq!(cache, sample());
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let storage = MemoryStorage::new();
        let name = write_snapshot(&storage, Version::new(3), &sample()).unwrap();
        storage.corrupt(&name, HEADER_SIZE + 5).unwrap();

        let result: Result<(Version, Map)> = read_snapshot(&storage, &name);
        assert!(matches!(result, Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_short_payload_detected() {
        let storage = MemoryStorage::new();
        let name = write_snapshot(&storage, Version::new(3), &sample()).unwrap();
        let size = storage.size(&name).unwrap();
        storage.truncate(&name, size - 1).unwrap();

        let result: Result<(Version, Map)> = read_snapshot(&storage, &name);
        assert!(matches!(result, Err(Error::Decode("snapshot", _))));
    }

    #[test]
    fn test_name_must_match_header() {
        let storage = MemoryStorage::new();
        let name = write_snapshot(&storage, Version::new(3), &sample()).unwrap();
        let bytes = storage.read(&name).unwrap();
        let renamed = snapshot_name(Version::new(4));
        storage.put(&renamed, &bytes).unwrap();

        let result: Result<(Version, Map)> = read_snapshot(&storage, &renamed);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_snapshot_names() {
        let name = snapshot_name(Version::new(0xabc));
        assert!(name.ends_with(".snap"));
        assert_eq!(parse_snapshot_name(&name), Some(Version::new(0xabc)));
        assert_eq!(parse_snapshot_name("00000000000000000000000000000abc.log"), None);
    }
}
