//! Error and Result types for the storage engine.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for engine operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// The error type for engine operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Key is smaller than the most recently inserted key.
    #[error("Key {key} is smaller than last inserted key {last}")]
    OrderViolation {
        /// Rejected key.
        key: u64,
        /// Most recently inserted key.
        last: u64,
    },

    /// Key equals the most recently inserted key.
    #[error("Duplicate key: {0}")]
    DuplicateKey(u64),

    /// Underlying device error, including short reads.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Key is not present or lies outside the live page range.
    #[error("Key not found")]
    NotFound,

    /// Variable-length payload was reclaimed by the circular log.
    #[error("Variable data has been deleted")]
    Deleted,

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Spline index has no points yet.
    #[error("Index has no points")]
    NotReady,

    /// Index page checksum does not match its entries.
    #[error("Checksum mismatch on index page {page}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Logical index page id.
        page: u32,
        /// Checksum stored in the page header.
        expected: u32,
        /// Checksum computed over the entries.
        actual: u32,
    },

    /// Page header failed a sanity check.
    #[error("Invalid page {page}: {reason}")]
    InvalidPage {
        /// Physical page number.
        page: u32,
        /// What was wrong with it.
        reason: &'static str,
    },
}

impl DbError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
