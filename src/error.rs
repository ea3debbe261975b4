//! Error types for the storage core.
//!
//! One variant per error kind named in the error-handling design: I/O,
//! capacity, concurrency, semantic (absent/corrupt), and invariant violations.
//! Unlike a SQL-surface error type, nothing here names a wire protocol or an
//! error code table — the core's only client is an in-process executor.

use std::fmt;
use std::io;

/// Unified error type for storage-core operations.
#[derive(Debug)]
pub enum CoreError {
    /// Page, log, or file I/O failure.
    Io(io::Error),
    /// A record or index entry does not fit in the space available.
    Capacity(String),
    /// Lock acquisition was cancelled (abort or timeout), or an unlock
    /// targeted a lock the caller did not hold.
    Lock(String),
    /// A slot, record, or log entry could not be parsed; treated as absent.
    Corrupt(String),
    /// A structural invariant was violated (uninitialized page mid-scan,
    /// LSN regression, undo log naming an unknown table). Fatal to the
    /// transaction that observed it.
    Invariant(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io(e) => write!(f, "I/O error: {}", e),
            CoreError::Capacity(msg) => write!(f, "capacity error: {}", msg),
            CoreError::Lock(msg) => write!(f, "lock error: {}", msg),
            CoreError::Corrupt(msg) => write!(f, "corrupt record: {}", msg),
            CoreError::Invariant(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        CoreError::Io(e)
    }
}

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        CoreError::Corrupt(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Corrupt(e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
