//! Error types for the relational index and content store.

use thiserror::Error;

/// Errors surfaced by the publisher, retriever, and cleaner.
#[derive(Debug, Error)]
pub enum IndexError {
    /// SQLite returned an error while executing a statement.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A connection could not be checked out of the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON array column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Content identifier derivation failed.
    #[error("content addressing error: {0}")]
    ContentAddress(String),

    /// A payload whose transaction rows do not line up with its block.
    #[error("inconsistent payload at height {height}: {reason}")]
    InconsistentPayload { height: u64, reason: String },

    /// A height range whose stop precedes its start.
    #[error("invalid range: stop {stop} precedes start {start}")]
    InvalidRange { start: u64, stop: u64 },

    /// Bins cannot be built with a zero batch size.
    #[error("batch size must be greater than 0")]
    InvalidBatchSize,

    /// A value that does not fit the store's signed integer columns.
    #[error("value out of range for column {column}: {value}")]
    OutOfRange { column: &'static str, value: u64 },
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

pub(crate) fn to_sql_int(column: &'static str, value: u64) -> IndexResult<i64> {
    i64::try_from(value).map_err(|_| IndexError::OutOfRange { column, value })
}
