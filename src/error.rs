//! Error kinds surfaced by the state store.
//!
//! Recoverable block outcomes (already-have / disconnected / invalid) are
//! not errors; they are carried by `AddBlockResult`. Everything here aborts
//! the enclosing write savepoint when raised inside one.

use thiserror::Error;

use crate::types::Bytes32;

/// One row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fkid: i64,
}

#[derive(Debug, Error)]
pub enum ChainStorageError {
    #[error("missing block in chain: {0}")]
    MissingBlockInChain(Bytes32),

    #[error("block at height {0} exists but has no transactions generator")]
    GeneratorRefHasNoGenerator(u32),

    #[error(
        "Invalid operation to set spent: expected {expected} rows at height {height}, updated {updated}"
    )]
    DoubleSpendOrMissingCoin {
        expected: usize,
        updated: usize,
        height: u32,
    },

    #[error("unsupported database schema version {0}, expected 2")]
    UnsupportedSchemaVersion(u32),

    #[error("found {count} foreign key violations: {0:?}", count = .0.len())]
    ForeignKeyViolations(Vec<ForeignKeyViolation>),

    #[error("unable to enable delayed foreign key enforcement in a nested request")]
    NestedForeignKeyDelayedRequest,

    #[error("database corruption: {0}")]
    Corruption(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl ChainStorageError {
    /// Fatal conditions mean the process should stop serving rather than
    /// retry; see the propagation policy in the module docs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainStorageError::Corruption(_))
    }
}
