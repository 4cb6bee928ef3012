use std::io;
use std::sync::PoisonError;

use crate::version::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The underlying storage call failed. No retry is attempted here.
    StorageUnavailable(io::Error),
    /// Persisted history could not be replayed into a trustworthy cache.
    Recovery(String),
    UnknownTransactionKind(u8),
    InvalidState(String),
    /// Two appends raced past the writer lock. Unreachable under correct locking.
    VersionConflict {
        expected: Version,
        actual: Version,
    },
    Encode(&'static str, String),
    Decode(&'static str, String),
    ChecksumMismatch,
    InvalidHeader(String),
    MutexPoisoned,
    LockError(io::Error),
}

impl Error {
    /// Wraps a failure hit while replaying persisted history.
    ///
    /// Unknown transaction kinds keep their identity so callers can tell a
    /// registry misconfiguration apart from corruption.
    pub(crate) fn into_recovery(self, context: &str) -> Error {
        match self {
            Error::UnknownTransactionKind(_) | Error::Recovery(_) => self,
            other => Error::Recovery(format!("{}: {}", context, other)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::StorageUnavailable(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::StorageUnavailable(err) => write!(f, "Storage unavailable: {}", err),
            Error::Recovery(msg) => write!(f, "Recovery failed: {}", msg),
            Error::UnknownTransactionKind(tag) => {
                write!(f, "Unknown transaction kind: 0x{:02x}", tag)
            }
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::VersionConflict { expected, actual } => write!(
                f,
                "Version conflict: expected {}, got {}",
                expected, actual
            ),
            Error::Encode(field, msg) => write!(f, "Failed to encode {}: {}", field, msg),
            Error::Decode(field, msg) => write!(f, "Failed to decode {}: {}", field, msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidHeader(msg) => write!(f, "Invalid header: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StorageUnavailable(err) | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
