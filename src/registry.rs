use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::transaction::Transaction;
use crate::Error;

pub type DecodeFn<T> = fn(&[u8]) -> Result<T>;

struct Kind<T> {
    name: &'static str,
    decode: DecodeFn<T>,
}

impl<T> Clone for Kind<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            decode: self.decode,
        }
    }
}

/// Maps transaction kind tags to decoders.
///
/// Encoded form of a transaction: `[tag:u8][payload]`. Decoding tells an
/// unregistered tag (`UnknownTransactionKind`) apart from a payload the
/// registered decoder rejects (`Decode`).
pub struct Registry<T> {
    kinds: BTreeMap<u8, Kind<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            kinds: self.kinds.clone(),
        }
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.kinds.iter().map(|(tag, kind)| (tag, kind.name)))
            .finish()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Registers `tag`. Re-registering a tag replaces its decoder.
    pub fn register(mut self, tag: u8, name: &'static str, decode: DecodeFn<T>) -> Self {
        if let Some(previous) = self.kinds.insert(tag, Kind { name, decode }) {
            tracing::warn!(
                tag = tag,
                previous = previous.name,
                replacement = name,
                "Transaction kind registered twice"
            );
        }
        self
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.kinds.contains_key(&tag)
    }

    pub fn name(&self, tag: u8) -> Option<&'static str> {
        self.kinds.get(&tag).map(|kind| kind.name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl<T: Transaction> Registry<T> {
    /// Encodes `tx`, refusing kinds that could not be decoded on replay.
    pub fn encode(&self, tx: &T) -> Result<Vec<u8>> {
        let tag = tx.kind();
        if !self.contains(tag) {
            return Err(Error::UnknownTransactionKind(tag));
        }

        let payload = tx.encode_payload()?;
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(tag);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<T> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| Error::Decode("transaction", "empty record".to_string()))?;
        let kind = self
            .kinds
            .get(&tag)
            .ok_or(Error::UnknownTransactionKind(tag))?;
        (kind.decode)(payload)
    }
}
