//! Store error type and the Full-condition probe.

use vouch_sdk::CodecError;

/// Errors surfaced by store operations.
///
/// `Full` is an internal signal: the eviction loop consumes it and either
/// retries or escalates to `NotEnoughSpace`. Callers never observe `Full`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,

    #[error("database full")]
    Full,

    #[error("eviction could not free the requested space")]
    NotEnoughSpace,

    #[error("no such private key")]
    UnknownKey,

    #[error("store is shut down")]
    Shutdown,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("storage error: {0}")]
    Internal(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if is_full(&err) {
            StoreError::Full
        } else {
            StoreError::Internal(err)
        }
    }
}

/// Whether a rusqlite error is SQLITE_FULL (page budget exhausted).
pub fn is_full(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull)
}

pub type Result<T> = std::result::Result<T, StoreError>;
