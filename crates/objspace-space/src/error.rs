//! Error types for the space crate.

use objspace_store::{ErrorKind, StoreError};

/// Errors that can occur during object space operations.
#[derive(Debug, thiserror::Error)]
pub enum SpaceError {
    /// Storage layer failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A unique key already belongs to another object.
    #[error("duplicate key for {container}.{member}")]
    DuplicateKey { container: String, member: String },

    /// No container is declared for the object type.
    #[error("unknown container: {0}")]
    UnknownContainer(String),

    /// No index of the required kind is declared on the member.
    #[error("no index on {container}.{member}")]
    UnknownIndex { container: String, member: String },

    /// No live object has the id.
    #[error("{container} object {id} not found")]
    NotFound { container: String, id: u64 },

    /// The definition breaks a structural rule.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// An object could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SpaceError {
    /// Classification shared with the store's errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
            Self::DuplicateKey { .. } | Self::InvalidDefinition(_) => ErrorKind::Schema,
            Self::UnknownContainer(_) | Self::UnknownIndex { .. } => ErrorKind::Schema,
            Self::NotFound { .. } => ErrorKind::Range,
            Self::Serialization(_) => ErrorKind::Format,
        }
    }

    /// Fatal errors leave the space unusable until it is reopened.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(err) => err.is_fatal(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for SpaceError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience alias for space results.
pub type SpaceResult<T> = Result<T, SpaceError>;
