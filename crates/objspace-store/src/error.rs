use std::path::PathBuf;

use objspace_types::Digest;

/// Broad classification of a [`StoreError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operating system refused or failed an I/O operation.
    Io,
    /// Stored content disagrees with its integrity metadata.
    Integrity,
    /// Bytes on disk do not follow the expected layout.
    Format,
    /// An item does not match the declared schema or serializer.
    Schema,
    /// An index, offset or id lies outside the valid range.
    Range,
    /// The caller is not allowed to perform the operation.
    Access,
    /// The supplied configuration is unusable.
    Config,
}

/// Errors from the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying stream or scratch files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural corruption: broken sector chains, bad Merkle state.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// The recomputed Merkle root does not match the persisted one.
    #[error("merkle root mismatch: expected {expected}, computed {computed}")]
    RootMismatch { expected: Digest, computed: Digest },

    /// Malformed header, journal or length-prefixed content.
    #[error("format violation: {0}")]
    FormatViolation(String),

    /// Item size or schema mismatch.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Index or offset out of range.
    #[error("{what} {index} out of range (length {len})")]
    RangeViolation {
        what: &'static str,
        index: u64,
        len: u64,
    },

    /// The referenced object slot is vacant.
    #[error("object {0} not found")]
    ObjectNotFound(u64),

    /// No sector number is left to allocate.
    #[error("sector space exhausted")]
    FreeListExhausted,

    /// A mutation was attempted on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// Another process holds the file lock.
    #[error("file {} is locked by another writer", .0.display())]
    Locked(PathBuf),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::IntegrityViolation(_) | Self::RootMismatch { .. } => ErrorKind::Integrity,
            Self::FormatViolation(_) => ErrorKind::Format,
            Self::SchemaViolation(_) | Self::Serialization(_) => ErrorKind::Schema,
            Self::RangeViolation { .. } | Self::ObjectNotFound(_) | Self::FreeListExhausted => {
                ErrorKind::Range
            }
            Self::ReadOnly | Self::Locked(_) => ErrorKind::Access,
            Self::InvalidConfig(_) => ErrorKind::Config,
        }
    }

    /// Fatal errors leave the store in a state that must not be used further
    /// without reopening.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io | ErrorKind::Integrity | ErrorKind::Format
        )
    }

    pub(crate) fn range(what: &'static str, index: u64, len: u64) -> Self {
        Self::RangeViolation { what, index, len }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_fatality() {
        let io = StoreError::from(std::io::Error::other("disk gone"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.is_fatal());

        let schema = StoreError::SchemaViolation("size 12, expected 16".into());
        assert_eq!(schema.kind(), ErrorKind::Schema);
        assert!(!schema.is_fatal());

        let range = StoreError::range("item", 7, 3);
        assert_eq!(range.kind(), ErrorKind::Range);
        assert_eq!(range.to_string(), "item 7 out of range (length 3)");

        assert!(StoreError::FormatViolation("bad magic".into()).is_fatal());
        assert_eq!(StoreError::ReadOnly.kind(), ErrorKind::Access);
    }

    #[test]
    fn root_mismatch_is_integrity() {
        let err = StoreError::RootMismatch {
            expected: Digest::zero(4),
            computed: Digest::from_vec(vec![1, 2, 3, 4]),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("01020304"));
    }
}
