use ot_kit::OtError;
use thiserror::Error;

use crate::codec::CodecError;

/// Error type for the persistence backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An error from rusqlite.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored diff or snapshot blob could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Lock poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
    /// A revision row carries a kind this version does not know.
    #[error("unknown commit kind {0:?}")]
    UnknownCommitKind(String),
}

impl From<StoreError> for OtError {
    fn from(err: StoreError) -> Self {
        OtError::storage(err)
    }
}
