//! Ledger error types.

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Record failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Record failed to encode.
    #[error("encode error: {0}")]
    Encode(String),

    /// No row with this key.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional update observed a concurrent mutation.
    #[error("concurrent update of {0}")]
    ConcurrentUpdate(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<redb::DatabaseError> for LedgerError {
    fn from(err: redb::DatabaseError) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<redb::TransactionError> for LedgerError {
    fn from(err: redb::TransactionError) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<redb::TableError> for LedgerError {
    fn from(err: redb::TableError) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<redb::StorageError> for LedgerError {
    fn from(err: redb::StorageError) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<redb::CommitError> for LedgerError {
    fn from(err: redb::CommitError) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}
