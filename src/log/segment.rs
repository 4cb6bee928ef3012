//! Log segment format.
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|  magic "ASHST\0LG", format:u32, base:u128
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each record:
//!
//! ```text
//! +---------+-------------+--------------+-------------------+-----------+
//! | len:u32 | len_crc:u32 | version:u128 | tag:u8 | payload  | crc32:u32 |
//! +---------+-------------+--------------+-------------------+-----------+
//! ```
//!
//! `len` counts the version and entry bytes and is guarded by its own
//! CRC-32C, so a damaged length is reported instead of being read as a torn
//! tail. The trailing checksum covers the version and entry bytes. Integers
//! are big-endian.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::version::Version;
use crate::Error;

pub const HEADER_SIZE: usize = 64;
pub const EXTENSION: &str = ".log";

const MAGIC: &[u8; 8] = b"ASHST\x00LG";
const FORMAT: u32 = 1;
const LEN_SIZE: usize = 4;
const PREFIX_SIZE: usize = LEN_SIZE + 4;
const VERSION_SIZE: usize = 16;
const CRC_SIZE: usize = 4;

/// Largest accepted record body (version plus entry).
pub const MAX_RECORD_LEN: usize = 1 << 30;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn segment_name(base: Version) -> String {
    format!("{:032x}{}", base.get(), EXTENSION)
}

/// Base version encoded in a segment name, or `None` for other objects.
pub fn parse_segment_name(name: &str) -> Option<Version> {
    let stem = name.strip_suffix(EXTENSION)?;
    if stem.len() != 32 {
        return None;
    }
    u128::from_str_radix(stem, 16).ok().map(Version::new)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    pub format: u32,
    /// Version of the first record the segment may hold.
    pub base: Version,
}

impl SegmentHeader {
    pub fn new(base: Version) -> Self {
        SegmentHeader {
            magic: *MAGIC,
            format: FORMAT,
            base,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::InvalidHeader("bad segment magic".to_string()));
        }
        if self.format != FORMAT {
            return Err(Error::InvalidHeader(format!(
                "unsupported segment format {}",
                self.format
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.format.to_be_bytes());
        buf[12..28].copy_from_slice(&self.base.get().to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "segment header needs {} bytes, found {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        let format = (&bytes[8..12]).read_u32::<BigEndian>()?;
        let base = (&bytes[12..28]).read_u128::<BigEndian>()?;

        let header = Self {
            magic,
            format,
            base: Version::new(base),
        };
        header.validate()?;
        Ok(header)
    }
}

/// One decoded log entry. `entry` is the registry encoding: `[tag][payload]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub version: Version,
    pub entry: Vec<u8>,
}

pub fn encode_record(version: Version, entry: &[u8]) -> Result<Vec<u8>> {
    let body_len = VERSION_SIZE + entry.len();
    if body_len > MAX_RECORD_LEN {
        return Err(Error::Encode(
            "log record",
            format!("{} bytes is too large", body_len),
        ));
    }
    let len = (body_len as u32).to_be_bytes();

    let mut buf = Vec::with_capacity(PREFIX_SIZE + body_len + CRC_SIZE);
    buf.extend_from_slice(&len);
    buf.write_u32::<BigEndian>(CRC32.checksum(&len))?;
    buf.write_u128::<BigEndian>(version.get())?;
    buf.extend_from_slice(entry);
    let checksum = CRC32.checksum(&buf[PREFIX_SIZE..]);
    buf.write_u32::<BigEndian>(checksum)?;
    Ok(buf)
}

/// Walks the records of one segment body (the bytes after the header).
///
/// A record cut short by the end of the body is a torn tail: iteration stops
/// and [`SegmentReader::torn`] reports it. A length prefix or a complete
/// record whose checksum does not match is an error.
pub struct SegmentReader<'a> {
    body: &'a [u8],
    pos: usize,
    torn: bool,
    failed: bool,
}

impl<'a> SegmentReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            body,
            pos: 0,
            torn: false,
            failed: false,
        }
    }

    pub fn torn(&self) -> bool {
        self.torn
    }

    /// Body offset just past the last complete record read.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read(&mut self) -> Result<Option<LogRecord>> {
        let rest = &self.body[self.pos..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.len() < PREFIX_SIZE {
            self.torn = true;
            return Ok(None);
        }

        let len_crc = (&rest[LEN_SIZE..PREFIX_SIZE]).read_u32::<BigEndian>()?;
        if CRC32.checksum(&rest[..LEN_SIZE]) != len_crc {
            return Err(Error::ChecksumMismatch);
        }
        let len = (&rest[..LEN_SIZE]).read_u32::<BigEndian>()? as usize;
        if !(VERSION_SIZE..=MAX_RECORD_LEN).contains(&len) {
            return Err(Error::Decode(
                "log record",
                format!("length {} out of range", len),
            ));
        }
        let total = PREFIX_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            self.torn = true;
            return Ok(None);
        }

        let body = &rest[PREFIX_SIZE..PREFIX_SIZE + len];
        let stored = (&rest[PREFIX_SIZE + len..total]).read_u32::<BigEndian>()?;
        if CRC32.checksum(body) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let version = Version::new((&body[..VERSION_SIZE]).read_u128::<BigEndian>()?);
        self.pos += total;
        Ok(Some(LogRecord {
            version,
            entry: body[VERSION_SIZE..].to_vec(),
        }))
    }
}

impl Iterator for SegmentReader<'_> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(records: &[(u128, &[u8])]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|(v, entry)| encode_record(Version::new(*v), entry).unwrap())
            .collect()
    }

    #[test]
    fn test_segment_name_ordering() {
        let names: Vec<_> = [1u128, 9, 10, 255, 4096]
            .iter()
            .map(|v| segment_name(Version::new(*v)))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        assert_eq!(parse_segment_name(&names[2]), Some(Version::new(10)));
        assert_eq!(parse_segment_name("LOCK"), None);
        assert_eq!(parse_segment_name("0a.log"), None);
        assert_eq!(parse_segment_name(&names[2].replace(".log", ".snap")), None);
    }

    #[test]
    fn test_header_encoding_decoding() {
        let header = SegmentHeader::new(Version::new(u128::MAX - 3));
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(SegmentHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_magic_validation() {
        let mut encoded = SegmentHeader::new(Version::new(1)).encode();
        encoded[0..8].copy_from_slice(b"INVALID!");
        assert!(matches!(
            SegmentHeader::decode(&encoded),
            Err(Error::InvalidHeader(_))
        ));

        let short = [0u8; HEADER_SIZE - 2];
        assert!(matches!(
            SegmentHeader::decode(&short),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_reader_yields_records_in_order() {
        let bytes = body(&[(1, b"\x01a"), (2, b"\x02b"), (3, b"\x03")]);
        let mut reader = SegmentReader::new(&bytes);
        let records: Vec<_> = reader.by_ref().collect::<Result<_>>().unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].version, Version::new(1));
        assert_eq!(records[1].entry, b"\x02b");
        assert_eq!(records[2].entry, b"\x03");
        assert!(!reader.torn());
        assert_eq!(reader.position(), bytes.len());
    }

    #[test]
    fn test_torn_tail_stops_cleanly() {
        let full = body(&[(1, b"\x01first"), (2, b"\x01second")]);
        let first_len = encode_record(Version::new(1), b"\x01first").unwrap().len();

        for cut in [first_len + 1, first_len + 3, first_len + 10, full.len() - 1] {
            let mut reader = SegmentReader::new(&full[..cut]);
            let records: Vec<_> = reader.by_ref().collect::<Result<_>>().unwrap();
            assert_eq!(records.len(), 1, "cut at {}", cut);
            assert!(reader.torn());
            assert_eq!(reader.position(), first_len);
        }
    }

    #[test]
    fn test_checksum_mismatch_is_error() {
        let mut bytes = body(&[(1, b"\x01value"), (2, b"\x01other")]);
        bytes[PREFIX_SIZE + VERSION_SIZE + 2] ^= 0xff;

        let mut reader = SegmentReader::new(&bytes);
        assert!(matches!(reader.next(), Some(Err(Error::ChecksumMismatch))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_damaged_length_is_not_a_torn_tail() {
        let mut bytes = body(&[(1, b"\x01a"), (2, b"\x01b"), (3, b"\x01c")]);
        let first_len = encode_record(Version::new(1), b"\x01a").unwrap().len();
        // High byte of the second length: the record now claims to run far
        // past the end of the body.
        bytes[first_len] ^= 0x40;

        let mut reader = SegmentReader::new(&bytes);
        assert!(matches!(reader.next(), Some(Ok(_))));
        assert!(matches!(reader.next(), Some(Err(Error::ChecksumMismatch))));
        assert!(reader.next().is_none());
        assert!(!reader.torn());
    }

    #[test]
    fn test_out_of_range_length_is_rejected() {
        let len = ((MAX_RECORD_LEN + 1) as u32).to_be_bytes();
        let mut bytes = len.to_vec();
        bytes.extend_from_slice(&CRC32.checksum(&len).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 32]);

        let mut reader = SegmentReader::new(&bytes);
        assert!(matches!(reader.next(), Some(Err(Error::Decode(..)))));
        assert!(!reader.torn());
    }
}
