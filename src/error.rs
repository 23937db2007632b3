//! Error types for atomstore
//!
//! Provides a unified error type for all storage operations.

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------
    #[error("unknown connection URI scheme: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Driver / IO
    // -------------------------------------------------------------------------
    #[error("database driver error: {0}")]
    Driver(String),

    #[error("query returned no rows: {0}")]
    EmptyResult(String),

    #[error("unknown truth value type {0} on read")]
    UnknownTruthType(i32),

    #[error("unknown value type {0} on unpack")]
    UnknownValueType(i32),

    #[error("node name is {0} bytes; the unique index allows at most {max} bytes", max = crate::types::MAX_NODE_NAME_BYTES)]
    NameTooLong(usize),

    #[error("link arity is {0}; the unique index allows at most {max} atoms", max = crate::types::MAX_LINK_ARITY)]
    ArityTooLarge(usize),

    #[error("valuation references key uuid {0} which is not resolvable")]
    MissingValueKey(u64),

    #[error("atom type {0} is not known to this runtime")]
    UnknownAtomType(String),

    // -------------------------------------------------------------------------
    // Invariant violations
    // -------------------------------------------------------------------------
    #[error("type map overflow: more than {0} distinct types")]
    TypemapOverflow(usize),

    #[error("uuid {0} was announced as created but never reached the id cache")]
    IdCacheDesync(u64),

    #[error("recursion depth limit {0} exceeded while walking atoms")]
    RecursionDepth(usize),
}

impl StoreError {
    /// True for the driver-level failures that the INSERT retry path
    /// is allowed to recover from.
    pub fn is_driver(&self) -> bool {
        matches!(self, StoreError::Driver(_))
    }
}
