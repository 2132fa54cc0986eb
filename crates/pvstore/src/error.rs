//! Error and Result types for archive storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for archive operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The error type for archive operations.
///
/// Variants fall into two families. Corruption ([`StoreError::is_corruption`]) describes bytes on disk
/// that cannot be trusted, and callers that walk a file may skip past it. Everything else is fatal for the
/// current operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record bytes could not be decoded.
    #[error("Decode error on {len} byte record: {reason}")]
    Decode {
        /// Length of the offending record in bytes.
        len: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Record checksum does not match expected value.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// CRC32 stored alongside the record.
        expected: u32,
        /// CRC32 computed over the record body.
        actual: u32,
    },

    /// The partition file is empty or its header line cannot be parsed.
    #[error("Missing header in {}: {reason}", path.display())]
    MissingHeader {
        /// File that was being opened.
        path: PathBuf,
        /// Why the header was rejected.
        reason: String,
    },

    /// A decoded seconds-into-year value that no valid record can carry.
    #[error("Impossible seconds-into-year {seconds}; record stream is corrupt")]
    ImpossibleTimestamp {
        /// The raw decoded value.
        seconds: u32,
    },

    /// The file belongs to a different PV.
    #[error("PV name mismatch: expected {expected}, found {found}")]
    PvNameMismatch {
        /// PV the caller asked for.
        expected: String,
        /// PV named in the file header.
        found: String,
    },

    /// The file holds a different value type.
    #[error("Value type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Type the caller asked for.
        expected: String,
        /// Type named in the file header.
        found: String,
    },

    /// Store configuration violates an invariant.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A partition file name does not follow the naming scheme.
    #[error("Invalid partition file name: {0}")]
    InvalidFileName(String),

    /// A sample or header is too large for the record format.
    #[error("Cannot encode {what} of {len}")]
    RecordTooLarge {
        /// Which part overflowed.
        what: &'static str,
        /// Its length or entry count.
        len: usize,
    },

    /// A single-use event stream was iterated twice.
    #[error("Event stream has already been iterated")]
    IteratorAlreadyOpened,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StoreError {
    /// Returns true if the error describes untrustworthy bytes rather than a failed operation.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Decode { .. }
                | Self::ChecksumMismatch { .. }
                | Self::MissingHeader { .. }
                | Self::ImpossibleTimestamp { .. }
        )
    }

    pub(crate) fn decode(len: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            len,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(StoreError::decode(4, "short").is_corruption());
        assert!(StoreError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(StoreError::ImpossibleTimestamp { seconds: u32::MAX }.is_corruption());
        assert!(!StoreError::InvalidConfig("hold".to_string()).is_corruption());
        assert!(!StoreError::RecordTooLarge {
            what: "field map",
            len: 70_000
        }
        .is_corruption());
        assert!(!StoreError::from(io::Error::other("disk")).is_corruption());
    }
}
