use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::Error;

/// Position in the transaction sequence.
///
/// Version `0` is the empty state before any append. Each append takes the
/// next version, so versions are dense and strictly increasing. The counter
/// is 128 bits wide; exhausting it is reported as an error instead of wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u128);

impl Version {
    pub const ZERO: Version = Version(0);

    pub const fn new(value: u128) -> Self {
        Version(value)
    }

    pub const fn get(self) -> u128 {
        self.0
    }

    pub fn next(self) -> Result<Version> {
        self.0
            .checked_add(1)
            .map(Version)
            .ok_or_else(|| Error::InvalidState("version counter exhausted".to_string()))
    }

    /// Number of versions in `(since, self]`, saturating at zero.
    pub fn distance_from(self, since: Version) -> u128 {
        self.0.saturating_sub(since.0)
    }
}

impl From<u128> for Version {
    fn from(value: u128) -> Self {
        Version(value)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version(value as u128)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
