//! Error types for the fleetstate state subsystem
//!
//! One unified error type is used across the store, lastseen and check
//! crates. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! ## Error Categories
//!
//! - **Not Found**: key absent; never fatal for optional reads
//! - **Corruption**: engine-detected structural damage (`Corrupt`), or
//!   damage that survived the move-aside retry (`PermanentCorrupt`)
//! - **Capacity**: map/readers/transaction/cursor limits, oversized
//!   keys and values
//! - **Transaction**: invalid or cross-environment transaction use
//! - **Schema**: migration failures, incoherent lastseen indexes,
//!   validator failures
//! - **Transport**: underlying file I/O failures, with context

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fleetstate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced by the database layer
#[derive(Debug, Error)]
pub enum Error {
    /// Key absent from the database
    #[error("key not found")]
    NotFound,

    /// Engine reported structural damage
    #[error("database '{path}' is corrupt: {message}")]
    Corrupt {
        /// Database file
        path: PathBuf,
        /// Engine-reported detail
        message: String,
    },

    /// Corruption survived the move-aside-and-retry recovery
    #[error("database '{path}' is corrupt and could not be recreated")]
    PermanentCorrupt {
        /// Database file
        path: PathBuf,
    },

    /// Configured map size exhausted
    #[error("database '{path}' is full")]
    MapFull {
        /// Database file
        path: PathBuf,
    },

    /// Transaction has too many dirty pages
    #[error("transaction has too many dirty pages")]
    TxnFull,

    /// Reader lock table is full
    #[error("reader lock table full")]
    ReadersFull,

    /// Too many named databases in the environment
    #[error("too many open databases in environment")]
    DbsFull,

    /// Cursor stack too deep
    #[error("cursor stack too deep")]
    CursorFull,

    /// Transaction is invalid or was used across environments
    #[error("bad or invalid transaction")]
    BadTxn,

    /// On-disk format was written by an incompatible engine version
    #[error("database environment version mismatch")]
    VersionMismatch,

    /// Operation incompatible with the database layout
    #[error("operation incompatible with database")]
    Incompatible,

    /// Key exceeds the engine's size limit (or is empty)
    #[error("key of {size} bytes exceeds maximum of {max} bytes")]
    KeyTooLarge {
        /// Offered key size
        size: usize,
        /// Engine limit
        max: usize,
    },

    /// Value exceeds the engine's size limit
    #[error("value of {size} bytes exceeds the engine's size limit")]
    ValueTooLarge {
        /// Offered value size
        size: usize,
    },

    /// Schema migration failed
    #[error("migration of '{path}' failed: {message}")]
    Migration {
        /// Database file
        path: PathBuf,
        /// What went wrong
        message: String,
    },

    /// Lastseen cross-entry invariants are violated
    #[error("lastseen database is incoherent")]
    Incoherent,

    /// The validator accumulated one or more defects
    #[error("validation failed with {errors} error(s)")]
    ValidateFailed {
        /// Number of per-entry and cross-entry defects
        errors: usize,
    },

    /// Underlying file I/O failure
    #[error("{context}: {source}")]
    Io {
        /// Filename and operation
        context: String,
        /// OS error
        #[source]
        source: io::Error,
    },

    /// Unexpected internal state (a bug)
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Attach filename/operation context to an I/O error
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// True for plain key-absent results
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True when the engine reported structural damage
    ///
    /// Used by the registry to decide whether a store should be moved
    /// aside to `<name>.broken` and recreated.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupt { .. }
                | Error::PermanentCorrupt { .. }
                | Error::VersionMismatch
                | Error::Incompatible
        )
    }

    /// True for capacity-class errors (logged, never auto-recovered)
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::MapFull { .. }
                | Error::TxnFull
                | Error::ReadersFull
                | Error::DbsFull
                | Error::CursorFull
                | Error::KeyTooLarge { .. }
                | Error::ValueTooLarge { .. }
        )
    }
}
